//! Per-link configuration and the parameters negotiated at contact start.

use std::fmt::Write as _;
use thiserror::Error as ThisError;

/// How a link is brought up and torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Opened when there is traffic, closed when idle.
    OnDemand,
    /// Held open for the duration of the contact.
    AlwaysOn,
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum LinkParamsError {
    #[error("unrecognized link option {0:?}")]
    UnknownOption(String),
    #[error("invalid value {value:?} for link option {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// The per-connection protocol knobs. The booleans and the keepalive
/// interval are negotiated down with the peer during the handshake;
/// `segment_length` is purely local, each side using its own value for its
/// sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParams {
    /// Require segment-level acks. Negotiated by AND; marks the link
    /// reliable.
    pub segment_ack_enabled: bool,
    /// Allow a partially received bundle to be delivered as a fragment when
    /// the contact breaks. Negotiated by AND.
    pub reactive_frag_enabled: bool,
    /// Max seconds of send-side silence before a keepalive goes out.
    /// Negotiated to the min of the two sides; zero disables.
    pub keepalive_interval: u16,
    /// Target max payload bytes per data segment. Not negotiated.
    pub segment_length: u32,
    /// Break the contact when nothing is heard for this many milliseconds.
    pub data_timeout: u32,
    /// For on-demand links: close when no data moves in either direction
    /// for this many seconds. Zero disables.
    pub idle_close_time: u32,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            segment_ack_enabled: true,
            reactive_frag_enabled: false,
            keepalive_interval: 10,
            segment_length: 4096,
            data_timeout: 30_000,
            idle_close_time: 30,
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, LinkParamsError> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(LinkParamsError::InvalidValue {
            key,
            value: value.into(),
        }),
    }
}

fn parse_uint<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, LinkParamsError> {
    value.parse().map_err(|_| LinkParamsError::InvalidValue {
        key,
        value: value.into(),
    })
}

impl LinkParams {
    /// Applies a single `key=value` configuration option.
    pub fn apply_option(&mut self, option: &str) -> Result<(), LinkParamsError> {
        let (key, value) = option
            .split_once('=')
            .ok_or_else(|| LinkParamsError::UnknownOption(option.into()))?;
        match key {
            "segment_ack_enabled" => {
                self.segment_ack_enabled = parse_bool("segment_ack_enabled", value)?;
            }
            "reactive_frag_enabled" => {
                self.reactive_frag_enabled = parse_bool("reactive_frag_enabled", value)?;
            }
            "keepalive_interval" => {
                self.keepalive_interval = parse_uint("keepalive_interval", value)?;
            }
            "segment_length" => {
                let segment_length = parse_uint("segment_length", value)?;
                if segment_length == 0 {
                    return Err(LinkParamsError::InvalidValue {
                        key: "segment_length",
                        value: value.into(),
                    });
                }
                self.segment_length = segment_length;
            }
            "data_timeout" => self.data_timeout = parse_uint("data_timeout", value)?,
            "idle_close_time" => self.idle_close_time = parse_uint("idle_close_time", value)?,
            _ => return Err(LinkParamsError::UnknownOption(option.into())),
        }
        Ok(())
    }

    /// Parses a whitespace-separated list of `key=value` options on top of
    /// the defaults.
    pub fn parse(options: &str) -> Result<Self, LinkParamsError> {
        let mut params = Self::default();
        for option in options.split_whitespace() {
            params.apply_option(option)?;
        }
        Ok(params)
    }

    /// Folds the peer's advertised settings into this side's, per the
    /// negotiation rule: min of the keepalive intervals, AND of the
    /// booleans. Segment length stays local.
    pub fn negotiate(&mut self, peer_segment_ack: bool, peer_reactive_frag: bool, peer_keepalive: u16) {
        self.keepalive_interval = self.keepalive_interval.min(peer_keepalive);
        self.segment_ack_enabled = self.segment_ack_enabled && peer_segment_ack;
        self.reactive_frag_enabled = self.reactive_frag_enabled && peer_reactive_frag;
    }

    /// Renders the parameters as `key: value` lines for link dumps.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "segment_ack_enabled: {}", self.segment_ack_enabled as u8);
        let _ = writeln!(
            out,
            "reactive_frag_enabled: {}",
            self.reactive_frag_enabled as u8
        );
        let _ = writeln!(out, "keepalive_interval: {}", self.keepalive_interval);
        let _ = writeln!(out, "segment_length: {}", self.segment_length);
        let _ = writeln!(out, "data_timeout: {}", self.data_timeout);
        let _ = writeln!(out, "idle_close_time: {}", self.idle_close_time);
        out
    }
}
