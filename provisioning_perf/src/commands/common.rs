use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, Local};
use clap::Parser;
use provisioning_client::Client;
use secrecy::{ExposeSecret, Secret};
use url::Url;

#[derive(Debug, Parser)]
pub(crate) struct ProvisioningConfig {
    /// The base URL of the Provisioning API
    #[clap(
        long = "url",
        env = "PROVISIONING_API_BASE_URL",
        default_value = "http://localhost:7777"
    )]
    pub(crate) base_url: Url,

    /// User for managing subscriptions
    #[clap(
        long = "admin-username",
        env = "PROVISIONING_ADMIN_USERNAME",
        default_value = "admin"
    )]
    pub(crate) admin_username: String,

    #[clap(
        long = "admin-password",
        env = "PROVISIONING_ADMIN_PASSWORD",
        default_value = "provisioning",
        hide_default_value = true
    )]
    pub(crate) admin_password: Secret<String>,

    /// Publisher used to generate the messages
    #[clap(
        long = "events-username",
        env = "PROVISIONING_EVENTS_USERNAME",
        default_value = "udm"
    )]
    pub(crate) events_username: String,

    #[clap(
        long = "events-password",
        env = "PROVISIONING_EVENTS_PASSWORD",
        default_value = "udmpass",
        hide_default_value = true
    )]
    pub(crate) events_password: Secret<String>,
}

/// The admin and publisher clients, sharing one connection pool
#[derive(Debug)]
pub(crate) struct Clients {
    pub(crate) admin: Client,
    pub(crate) events: Client,
}

pub(crate) fn create_clients(config: &ProvisioningConfig) -> Result<Clients, anyhow::Error> {
    let admin = Client::new(
        config.base_url.clone(),
        config.admin_username.clone(),
        config.admin_password.expose_secret().clone(),
    )
    .with_context(|| format!("failed to create client for {}", config.base_url))?;
    let events = admin.fork(
        config.events_username.clone(),
        config.events_password.expose_secret().clone(),
    );
    Ok(Clients { admin, events })
}

/// A time in the future
///
/// Parses either a human readable offset from now, e.g., `10m`, or an exact date-time in RFC3339
/// form, e.g., `2025-10-30T19:10:00-04:00`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FutureOffsetTime(DateTime<Local>);

impl FutureOffsetTime {
    /// Time left until this point, zero if it has already passed
    pub(crate) fn remaining(&self) -> std::time::Duration {
        (self.0 - Local::now()).to_std().unwrap_or_default()
    }
}

impl FromStr for FutureOffsetTime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(t) = humantime::parse_rfc3339_weak(s) {
            Ok(Self(DateTime::<Local>::from(t)))
        } else {
            humantime::parse_duration(s)
                .map(|d| Local::now() + d)
                .map(Self)
                .with_context(|| format!("could not parse future offset time value: {s}"))
        }
    }
}
