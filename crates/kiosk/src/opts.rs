use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

/// Struct that gets generated from `RawOpt`.
#[derive(Debug, PartialEq)]
pub struct Opt {
    pub log_debug: bool,
    pub scan_interval: Duration,
    pub service: String,
    pub action: Action,
}

#[derive(Parser, Debug, PartialEq)]
#[command(name = "kiosk", version, about = "WiFi panel backend for kiosk devices")]
pub struct RawOpt {
    /// Write out debug logs.
    #[arg(long = "debug", global = true)]
    log_debug: bool,

    /// Milliseconds between two WiFi scan requests
    #[arg(long, global = true, default_value_t = 3000)]
    scan_interval: u64,

    /// Bus name of the NetworkManager service
    #[arg(long, global = true, default_value = "org.freedesktop.NetworkManager")]
    service: String,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Action {
    /// Print the WiFi panel as JSON.
    #[command(name = "wifi", alias = "w")]
    Wifi {
        /// Keep running and print the panel again whenever it changes
        #[arg(short, long)]
        watch: bool,
    },

    /// Print the configured WiFi connections.
    #[command(name = "connections")]
    Connections,

    /// Turn wireless networking on or off
    #[command(name = "wireless")]
    Wireless { state: Toggle },

    /// Connect to the network with the given SSID, creating a connection for it if needed.
    #[command(name = "connect", alias = "c")]
    Connect {
        ssid: String,

        /// Passphrase for a secured network that has no connection yet
        #[arg(short, long)]
        passphrase: Option<String>,
    },

    /// Delete the configured connection of the given SSID
    #[command(name = "forget")]
    Forget { ssid: String },

    /// Generate a shell completion script
    ShellCompletions {
        #[arg(short, long)]
        shell: clap_complete::Shell,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
}

impl Opt {
    pub fn from_env() -> Self {
        let raw: RawOpt = RawOpt::parse();
        raw.into()
    }
}

impl From<RawOpt> for Opt {
    fn from(other: RawOpt) -> Self {
        let RawOpt { log_debug, scan_interval, service, action } = other;
        Opt { log_debug, scan_interval: Duration::from_millis(scan_interval), service, action }
    }
}
