//! HTTP reporting channel to the fleet server
//!
//! All traffic is JSON POSTs authenticated with the shared agent secret.
//! Telemetry-style reports retry a bounded number of times and are then
//! dropped; the next cycle carries fresh data anyway. Registration
//! retries until the server accepts it.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::context::AgentContext;
use crate::execution::{self, CommandResult, Directive};
use crate::inventory::MachineInfo;
use crate::metrics::TelemetryRecord;

/// Envelope the server attaches to every accepted report.
///
/// `command` and `payload` may be missing, null or empty; only a
/// non-empty command carries a directive.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerReply {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

impl ServerReply {
    /// Extract the directive, if the reply carries one.
    pub fn directive(&self) -> Option<Directive> {
        let command = self.command.as_deref()?.trim();
        if command.is_empty() {
            return None;
        }

        Some(Directive {
            command: command.to_string(),
            payload: self.payload.clone().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RegistrationReply {
    #[serde(default)]
    ip_address: Option<String>,
}

#[derive(Serialize)]
struct SupportRequest<'a> {
    uuid: &'a str,
}

async fn post_once<T: Serialize>(
    ctx: &AgentContext,
    url: &str,
    payload: &T,
) -> reqwest::Result<reqwest::Response> {
    ctx.http()
        .post(url)
        .header("x-agent-secret", &ctx.config.server.secret)
        .json(payload)
        .send()
        .await
}

/// POST a JSON report with bounded retry.
///
/// Network failures and non-2xx statuses are retried the same way, with
/// a fixed delay between attempts. Returns the directive from the
/// server's reply, when there is one.
pub async fn post_with_retry<T: Serialize>(
    ctx: &AgentContext,
    path: &str,
    payload: &T,
) -> Option<Directive> {
    let url = ctx.endpoint(path);
    let max_attempts = ctx.config.reporting.max_retries.max(1);

    for attempt in 1..=max_attempts {
        match post_once(ctx, &url, payload).await {
            Ok(response) if response.status().is_success() => {
                // An unreadable reply body still counts as delivered.
                return match response.json::<ServerReply>().await {
                    Ok(reply) => reply.directive(),
                    Err(_) => None,
                };
            }
            Ok(response) => {
                debug!(
                    "POST {} got status {} (attempt {}/{})",
                    url,
                    response.status(),
                    attempt,
                    max_attempts
                );
            }
            Err(e) => {
                debug!("POST {} failed: {} (attempt {}/{})", url, e, attempt, max_attempts);
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(ctx.config.reporting.retry_delay()).await;
        }
    }

    warn!("Dropping report to {} after {} attempts", url, max_attempts);
    None
}

/// Register this machine, retrying until the server accepts.
///
/// Inventory is collected fresh at the start of each call, so a
/// re-registration after a restore point carries the new marker date.
pub async fn register(ctx: &Arc<AgentContext>) {
    let url = ctx.endpoint("/register");
    let retry_delay = ctx.config.reporting.registration_retry();
    let info = MachineInfo::collect(ctx).await;

    loop {
        match post_once(ctx, &url, &info).await {
            Ok(response) if response.status().is_success() => {
                let assigned_ip = match response.json::<RegistrationReply>().await {
                    Ok(reply) => reply.ip_address,
                    Err(_) => None,
                };

                match assigned_ip {
                    Some(ip) => {
                        ctx.set_last_known_ip(ip.clone());
                        info!("Machine registered: uuid={} ip={}", ctx.machine_id, ip);
                    }
                    None => info!("Machine registered: uuid={}", ctx.machine_id),
                }
                return;
            }
            Ok(response) => {
                debug!("Registration got status {}, retrying", response.status());
            }
            Err(e) => {
                debug!("Registration failed: {}, retrying", e);
            }
        }

        tokio::time::sleep(retry_delay).await;
    }
}

/// Report a command outcome. Single attempt; results are advisory.
pub async fn send_command_result(ctx: &AgentContext, result: &CommandResult) {
    let url = ctx.endpoint(&format!("/machines/{}/command-result", ctx.machine_id));

    match post_once(ctx, &url, result).await {
        Ok(response) if response.status().is_success() => {
            debug!("Command result delivered");
        }
        Ok(response) => {
            warn!("Command result rejected with status {}", response.status());
        }
        Err(e) => {
            warn!("Could not deliver command result: {}", e);
        }
    }
}

/// Ask the server to open a support ticket for this machine.
///
/// Returns the message to show the user. Retries like telemetry, but a
/// 409 means a ticket is already open and is not worth retrying.
pub async fn send_support_request(ctx: &AgentContext) -> Result<String> {
    let url = ctx.endpoint("/support/request");
    let payload = SupportRequest {
        uuid: &ctx.machine_id,
    };
    let max_attempts = ctx.config.reporting.max_retries.max(1);

    for attempt in 1..=max_attempts {
        match post_once(ctx, &url, &payload).await {
            Ok(response) if response.status().is_success() => {
                let message = match response.json::<ServerReply>().await {
                    Ok(reply) => reply.message,
                    Err(_) => None,
                };
                return Ok(message.unwrap_or_else(|| {
                    "Support request received, a technician was notified.".to_string()
                }));
            }
            Ok(response) if response.status() == reqwest::StatusCode::CONFLICT => {
                return Ok("A support ticket is already open for this machine.".to_string());
            }
            Ok(response) => {
                debug!(
                    "Support request got status {} (attempt {}/{})",
                    response.status(),
                    attempt,
                    max_attempts
                );
            }
            Err(e) => {
                debug!("Support request failed: {} (attempt {}/{})", e, attempt, max_attempts);
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(ctx.config.reporting.retry_delay()).await;
        }
    }

    Err(anyhow!("Could not reach the server, call IT directly"))
}

/// Telemetry duty: collect, post, dispatch any directive that comes back.
pub async fn telemetry_loop(ctx: Arc<AgentContext>) {
    let mut ticker = tokio::time::interval(ctx.config.reporting.telemetry_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let record = TelemetryRecord::collect(&ctx).await;
        if let Some(directive) = post_with_retry(&ctx, "/telemetry", &record).await {
            execution::dispatch(ctx.clone(), directive);
        }
    }
}
