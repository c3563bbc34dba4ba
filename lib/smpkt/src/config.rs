// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunables for formatting a region and for each CPU that uses it.
//!
//! Both structs deserialize from the same shape of table a board's
//! configuration carries, with every field optional.

use serde::Deserialize;
use smpkt_abi::{NotifyMethod, TasKind, DEFAULT_MAX_INPUT_PKTS};

/// Per-CPU protocol parameters, fixed when a descriptor is initialized.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct PktConfig {
    /// This CPU's slot in the CPU table.
    pub cpu: u16,
    /// Input queue depth. Zero selects `DEFAULT_MAX_INPUT_PKTS`.
    pub max_input_pkts: u32,
    /// How senders should wake us.
    pub notify: NotifyMethod,
    /// Platform ticks per second.
    pub ticks_per_sec: u32,
    /// Ticks between master heartbeats.
    pub ticks_per_beat: u32,
    /// How long a slave waits for the region to come alive.
    pub alive_timeout_secs: u32,
    /// How many heartbeat periods the master waits at attach. The master
    /// beats the region itself, so this is short.
    pub master_beats: u32,
    /// Attempts before a lock acquisition fails.
    pub tas_tries: u32,
    /// Extra doorbell attempts after the first one fails.
    pub notify_retries: u32,
    /// Ticks to wait between doorbell attempts.
    pub notify_retry_ticks: u32,
}

impl Default for PktConfig {
    fn default() -> Self {
        Self {
            cpu: 0,
            max_input_pkts: DEFAULT_MAX_INPUT_PKTS,
            notify: NotifyMethod::POLLED,
            ticks_per_sec: 100,
            ticks_per_beat: 100,
            alive_timeout_secs: 600,
            master_beats: 4,
            tas_tries: 1000,
            notify_retries: 5,
            notify_retry_ticks: 1,
        }
    }
}

impl PktConfig {
    pub fn for_cpu(cpu: u16) -> Self {
        Self {
            cpu,
            ..Self::default()
        }
    }

    /// Input queue depth after defaulting.
    pub fn input_depth(&self) -> u32 {
        match self.max_input_pkts {
            0 => DEFAULT_MAX_INPUT_PKTS,
            n => n,
        }
    }

    /// Number of heartbeat polls to make before declaring the region down.
    pub fn alive_polls(&self) -> u32 {
        if self.cpu == smpkt_abi::MASTER_CPU {
            return self.master_beats.max(1);
        }
        let ticks =
            u64::from(self.alive_timeout_secs) * u64::from(self.ticks_per_sec);
        let polls = ticks / u64::from(self.ticks_per_beat.max(1));
        polls.clamp(1, u64::from(u32::MAX)) as u32
    }
}

/// Parameters the master formats a region with.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct SetupConfig {
    /// Size of the CPU table, at most `SM_MAX_CPUS`.
    pub max_cpus: u16,
    /// Requested payload capacity; rounded up before use.
    pub max_pkt_bytes: u32,
    /// Lock discipline every CPU will use on this region.
    pub tas: TasKind,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            max_cpus: 10,
            max_pkt_bytes: 2176,
            tas: TasKind::Hard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smpkt_abi::NotifyKind;

    #[test]
    fn empty_table_is_default() {
        let c: PktConfig = toml::from_str("").unwrap();
        assert_eq!(c, PktConfig::default());
        let s: SetupConfig = toml::from_str("").unwrap();
        assert_eq!(s, SetupConfig::default());
    }

    #[test]
    fn parses_board_table() {
        let c: PktConfig = toml::from_str(
            r#"
            cpu = 3
            max-input-pkts = 0
            ticks-per-beat = 25
            notify = { kind = "mailbox4", args = [1, 0x4000, 7] }
            "#,
        )
        .unwrap();
        assert_eq!(c.cpu, 3);
        assert_eq!(c.input_depth(), DEFAULT_MAX_INPUT_PKTS);
        assert_eq!(c.notify.kind, NotifyKind::Mailbox4);
        assert_eq!(c.notify.args, [1, 0x4000, 7]);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<PktConfig>("cpus = 2").is_err());
        assert!(toml::from_str::<SetupConfig>(r#"tas = "sloppy""#).is_err());
    }

    #[test]
    fn setup_table() {
        let s: SetupConfig = toml::from_str(
            r#"
            max-cpus = 2
            max-pkt-bytes = 256
            tas = "soft"
            "#,
        )
        .unwrap();
        assert_eq!(s.max_cpus, 2);
        assert_eq!(s.tas, TasKind::Soft);
    }

    #[test]
    fn poll_budget() {
        let slave = PktConfig {
            ticks_per_beat: 25,
            ..PktConfig::for_cpu(1)
        };
        assert_eq!(slave.alive_polls(), 600 * 100 / 25);

        let master = PktConfig::for_cpu(0);
        assert_eq!(master.alive_polls(), 4);

        let hasty = PktConfig {
            alive_timeout_secs: 0,
            ..PktConfig::for_cpu(1)
        };
        assert_eq!(hasty.alive_polls(), 1);
    }
}
