/***************************************************************************************************
Per-instance throughput/latency tracking and the instance-change trigger.
The EMA update is a plain arithmetic helper, in the style of
`mc_utils::conv`'s numeric helpers, rather than pulling in a stats crate.
***************************************************************************************************/

use std::collections::HashMap;

use log::{info, warn};

use crate::ids::{ClientId, InstId, Timestamp};

/// Tunables for instance-change detection. Defaults match common EMA
/// smoothing conventions (`alpha = 0.1`) and a pragmatic check cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorConfig {
    /// EMA smoothing factor for per-instance throughput.
    pub alpha: f64,
    /// Master throughput must stay above `delta * backup_throughput`.
    pub delta: f64,
    /// Seconds between `check_performance` runs.
    pub check_period: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            alpha: 0.1,
            delta: 0.6,
            check_period: 15.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Throughput {
    ema: f64,
    ordered_since_last_check: u64,
}

impl Throughput {
    fn tick(&mut self, alpha: f64, elapsed_secs: f64) {
        let rate = if elapsed_secs > 0.0 {
            self.ordered_since_last_check as f64 / elapsed_secs
        } else {
            0.0
        };
        self.ema = alpha * rate + (1.0 - alpha) * self.ema;
        self.ordered_since_last_check = 0;
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LatencyAcc {
    count: u64,
    total: f64,
}

impl LatencyAcc {
    fn record(&mut self, latency_secs: f64) {
        self.count += 1;
        self.total += latency_secs;
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

/// Tracks ordering throughput and client latency for every instance this
/// node owns, and decides when the master instance is underperforming
/// relative to the backups.
#[derive(Debug)]
pub struct Monitor {
    config: MonitorConfig,
    throughput: Vec<Throughput>,
    latency: HashMap<ClientId, LatencyAcc>,
    last_check: Timestamp,
}

impl Monitor {
    pub fn new(instance_count: u32, config: MonitorConfig) -> Self {
        Monitor {
            config,
            throughput: vec![Throughput::default(); instance_count as usize],
            latency: HashMap::new(),
            last_check: Timestamp::ZERO,
        }
    }

    pub fn config(&self) -> MonitorConfig {
        self.config
    }

    /// A request was ordered (reached `committed`) on `inst_id`, taking
    /// `latency_secs` end to end. Master-instance records feed the
    /// per-client latency accumulator too.
    pub fn record_ordered(&mut self, inst_id: InstId, client: &ClientId, latency_secs: f64) {
        if let Some(t) = self.throughput.get_mut(inst_id.0 as usize) {
            t.ordered_since_last_check += 1;
        }
        if inst_id.is_master() {
            self.latency.entry(client.clone()).or_insert_with(LatencyAcc::default).record(latency_secs);
        }
    }

    /// Roll every instance's EMA forward by the elapsed interval since
    /// the last check.
    fn tick_all(&mut self, now: Timestamp) {
        let elapsed = now.0 - self.last_check.0;
        for t in &mut self.throughput {
            t.tick(self.config.alpha, elapsed);
        }
        self.last_check = now;
    }

    /// Compares the master's throughput against the average of the
    /// backups'. Returns `true` if it has fallen
    /// below `delta * backup_average` and an instance change should be
    /// proposed.
    pub fn check_performance(&mut self, now: Timestamp) -> bool {
        self.tick_all(now);
        if self.throughput.len() < 2 {
            return false;
        }
        let master = self.throughput[0].ema;
        let backups: Vec<f64> = self.throughput[1..].iter().map(|t| t.ema).collect();
        let backup_avg = backups.iter().sum::<f64>() / backups.len() as f64;

        if backup_avg <= 0.0 {
            return false;
        }
        let underperforming = master < self.config.delta * backup_avg;
        if underperforming {
            warn!(
                target: "monitor",
                "master throughput {:.3} below {:.2} * backup average {:.3}",
                master, self.config.delta, backup_avg
            );
        }
        underperforming
    }

    /// Ratio of master throughput to backup-average throughput, exposed
    /// for observability and tests.
    pub fn master_throughput_ratio(&self) -> f64 {
        if self.throughput.len() < 2 {
            return 1.0;
        }
        let master = self.throughput[0].ema;
        let backups: Vec<f64> = self.throughput[1..].iter().map(|t| t.ema).collect();
        let backup_avg = backups.iter().sum::<f64>() / backups.len() as f64;
        if backup_avg <= 0.0 {
            1.0
        } else {
            master / backup_avg
        }
    }

    pub fn average_latency(&self, client: &ClientId) -> Option<f64> {
        self.latency.get(client).map(|acc| acc.average())
    }

    /// Reset throughput history on view change; latency accumulators are
    /// per-client and survive views, since resetting client-facing
    /// latency stats on every view change would make them useless for the
    /// host's SLOs.
    pub fn on_view_change(&mut self) {
        for t in &mut self.throughput {
            *t = Throughput::default();
        }
        info!(target: "monitor", "throughput history reset on view change");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MonitorConfig {
        // alpha = 1.0 makes the EMA converge in a single check, so the
        // test doesn't need several `check_performance` rounds.
        MonitorConfig { alpha: 1.0, delta: 0.6, check_period: 15.0 }
    }

    #[test]
    fn instance_change_triggers_under_delta_violation() {
        let mut monitor = Monitor::new(2, config());
        let client = ClientId::from("alice");

        // Master (inst 0) orders once, the backup (inst 1) orders ten
        // times, both within the same one-second window.
        monitor.record_ordered(InstId(0), &client, 0.1);
        for _ in 0..10 {
            monitor.record_ordered(InstId(1), &client, 0.1);
        }

        let underperforming = monitor.check_performance(Timestamp(1.0));
        assert!(underperforming, "master throughput should fall below delta * backup average");
        assert!(monitor.master_throughput_ratio() < 0.6);
    }

    #[test]
    fn no_instance_change_when_master_keeps_up() {
        let mut monitor = Monitor::new(2, config());
        let client = ClientId::from("alice");
        for _ in 0..10 {
            monitor.record_ordered(InstId(0), &client, 0.1);
            monitor.record_ordered(InstId(1), &client, 0.1);
        }
        assert!(!monitor.check_performance(Timestamp(1.0)));
    }

    #[test]
    fn average_latency_is_per_client_and_master_only() {
        let mut monitor = Monitor::new(2, config());
        let alice = ClientId::from("alice");
        let bob = ClientId::from("bob");

        monitor.record_ordered(InstId(0), &alice, 1.0);
        monitor.record_ordered(InstId(0), &alice, 3.0);
        // Backup-instance commits never feed the latency accumulator.
        monitor.record_ordered(InstId(1), &alice, 100.0);
        monitor.record_ordered(InstId(0), &bob, 2.0);

        assert_eq!(monitor.average_latency(&alice), Some(2.0));
        assert_eq!(monitor.average_latency(&bob), Some(2.0));
        assert_eq!(monitor.average_latency(&ClientId::from("carol")), None);
    }
}
