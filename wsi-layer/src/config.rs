// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Environment configuration of the DMA-buf bridge.

use std::{path::PathBuf, time::Duration};

/// Path of the bridge's listening socket. The bridge is only used when this is set.
pub const BRIDGE_SOCKET_ENV: &str = "XWL_DMABUF_BRIDGE";
/// Present rate cap in frames per second. `0` disables pacing.
pub const BRIDGE_MAX_FPS_ENV: &str = "XWL_DMABUF_BRIDGE_MAX_FPS";
/// Prefer the linear modifier when choosing a buffer layout.
pub const BRIDGE_PREFER_LINEAR_ENV: &str = "XWL_DMABUF_BRIDGE_PREFER_LINEAR";
/// Keep mailbox and immediate present modes instead of downgrading them to FIFO.
pub const BRIDGE_ALLOW_MAILBOX_ENV: &str = "XWL_DMABUF_BRIDGE_ALLOW_MAILBOX";
/// How long a present waits for the remote's acknowledgment, in milliseconds.
pub const BRIDGE_FEEDBACK_TIMEOUT_ENV: &str = "XWL_DMABUF_BRIDGE_FEEDBACK_TIMEOUT_MS";

pub const DEFAULT_BRIDGE_FPS: u32 = 60;
pub const MAX_BRIDGE_FPS: u32 = 240;
pub const DEFAULT_FEEDBACK_TIMEOUT: Duration = Duration::from_millis(250);
pub const MAX_FEEDBACK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Bridge settings read from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// The socket to connect to. `None` means the bridge is not requested.
    pub socket_path: Option<PathBuf>,

    /// Maximum presents per second, or `None` if pacing is disabled.
    ///
    /// The default value is `Some(60)`.
    pub max_fps: Option<u32>,

    /// Whether the user set the frame cap explicitly.
    pub max_fps_overridden: bool,

    /// The default value is `false`.
    pub prefer_linear: bool,

    /// The default value is `false`.
    pub allow_mailbox: bool,

    /// The default value is 250 milliseconds.
    pub feedback_timeout: Duration,
}

impl Default for BridgeConfig {
    #[inline]
    fn default() -> Self {
        Self {
            socket_path: None,
            max_fps: Some(DEFAULT_BRIDGE_FPS),
            max_fps_overridden: false,
            prefer_linear: false,
            allow_mailbox: false,
            feedback_timeout: DEFAULT_FEEDBACK_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    /// Reads the configuration from the process environment.
    #[inline]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of a variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self {
            socket_path: lookup(BRIDGE_SOCKET_ENV)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            ..Default::default()
        };

        if let Some(value) = lookup(BRIDGE_MAX_FPS_ENV).filter(|v| !v.is_empty()) {
            config.max_fps_overridden = true;

            match value.parse::<u64>() {
                Ok(0) => config.max_fps = None,
                Ok(fps) => config.max_fps = Some(fps.min(MAX_BRIDGE_FPS as u64) as u32),
                Err(_) => {
                    log::warn!(
                        "invalid {}='{}', using default pacing",
                        BRIDGE_MAX_FPS_ENV,
                        value,
                    );
                }
            }
        }

        config.prefer_linear = lookup(BRIDGE_PREFER_LINEAR_ENV).is_some_and(|v| is_enabled(&v));
        config.allow_mailbox = lookup(BRIDGE_ALLOW_MAILBOX_ENV).is_some_and(|v| is_enabled(&v));

        if let Some(value) = lookup(BRIDGE_FEEDBACK_TIMEOUT_ENV).filter(|v| !v.is_empty()) {
            match value.parse::<u64>() {
                Ok(ms) => {
                    config.feedback_timeout = Duration::from_millis(ms).min(MAX_FEEDBACK_TIMEOUT);
                }
                Err(_) => {
                    log::warn!(
                        "invalid {}='{}', using default {} ms",
                        BRIDGE_FEEDBACK_TIMEOUT_ENV,
                        value,
                        DEFAULT_FEEDBACK_TIMEOUT.as_millis(),
                    );
                }
            }
        }

        config
    }

    /// Returns the minimum interval between two presents, or `None` if pacing is disabled.
    #[inline]
    pub fn present_interval(&self) -> Option<Duration> {
        self.max_fps
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

// Any value turns a flag on, except a lone "0".
fn is_enabled(value: &str) -> bool {
    value != "0"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> BridgeConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config(&[]);
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.socket_path, None);
        assert_eq!(
            config.present_interval(),
            Some(Duration::from_nanos(1_000_000_000 / 60))
        );
    }

    #[test]
    fn fps_is_clamped_and_zero_disables() {
        assert_eq!(config(&[(BRIDGE_MAX_FPS_ENV, "1000")]).max_fps, Some(240));
        assert_eq!(config(&[(BRIDGE_MAX_FPS_ENV, "30")]).max_fps, Some(30));

        let disabled = config(&[(BRIDGE_MAX_FPS_ENV, "0")]);
        assert_eq!(disabled.max_fps, None);
        assert_eq!(disabled.present_interval(), None);
        assert!(disabled.max_fps_overridden);
    }

    #[test]
    fn invalid_fps_keeps_default() {
        let config = config(&[(BRIDGE_MAX_FPS_ENV, "fast")]);
        assert_eq!(config.max_fps, Some(DEFAULT_BRIDGE_FPS));
    }

    #[test]
    fn flags_and_timeout() {
        let config = config(&[
            (BRIDGE_SOCKET_ENV, "/run/bridge.sock"),
            (BRIDGE_PREFER_LINEAR_ENV, "yes"),
            (BRIDGE_ALLOW_MAILBOX_ENV, "0"),
            (BRIDGE_FEEDBACK_TIMEOUT_ENV, "9000"),
        ]);
        assert_eq!(config.socket_path, Some(PathBuf::from("/run/bridge.sock")));
        assert!(config.prefer_linear);
        assert!(!config.allow_mailbox);
        assert_eq!(config.feedback_timeout, MAX_FEEDBACK_TIMEOUT);
    }

    #[test]
    fn empty_socket_path_is_ignored() {
        assert_eq!(config(&[(BRIDGE_SOCKET_ENV, "")]).socket_path, None);
    }
}
