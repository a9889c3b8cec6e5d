//! Statistics Registry
//!
//! Per-client accounting plus a one-second throughput series. Counters are
//! kept from the client's point of view: RX is what a client received from the
//! relay, TX is what it sent through it.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Samples kept in the chart buffer (30 minutes at one per second)
pub const CHART_CAPACITY: usize = 1800;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Accounting for one remote endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ClientRecord {
    pub address: SocketAddr,
    pub online: bool,
    pub online_time: DateTime<Utc>,
    pub offline_time: Option<DateTime<Utc>>,
    /// Bytes delivered to the client
    pub rx: u64,
    /// Bytes received from the client
    pub tx: u64,
}

/// One second of throughput
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartSample {
    /// Bytes clients sent during the interval
    pub transport_bytes: u64,
    /// Bytes clients received during the interval
    pub receive_bytes: u64,
    /// Wall clock label, `HH:MM:SS`
    pub label: String,
}

/// Point-in-time totals
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub online_clients: usize,
    pub known_clients: usize,
    pub rx_total: u64,
    pub tx_total: u64,
    pub chart_samples: usize,
}

#[derive(Default)]
struct Registry {
    /// Every record ever created, in accept order
    clients: Vec<ClientRecord>,
    /// Address -> index of its online record
    online: HashMap<SocketAddr, usize>,
}

struct Chart {
    samples: VecDeque<ChartSample>,
    capacity: usize,
    previous_rx: u64,
    previous_tx: u64,
}

/// Per-endpoint counters and throughput history
pub struct Statistics {
    registry: Mutex<Registry>,
    chart: Mutex<Chart>,
    rx_total: AtomicU64,
    tx_total: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::with_chart_capacity(CHART_CAPACITY)
    }

    pub fn with_chart_capacity(capacity: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            chart: Mutex::new(Chart {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                previous_rx: 0,
                previous_tx: 0,
            }),
            rx_total: AtomicU64::new(0),
            tx_total: AtomicU64::new(0),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chart_data(&self) -> MutexGuard<'_, Chart> {
        self.chart.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking an endpoint. No-op while it already has an online record.
    pub fn register(&self, address: SocketAddr) {
        let mut registry = self.registry();
        if registry.online.contains_key(&address) {
            return;
        }
        registry.clients.push(ClientRecord {
            address,
            online: true,
            online_time: Utc::now(),
            offline_time: None,
            rx: 0,
            tx: 0,
        });
        let index = registry.clients.len() - 1;
        registry.online.insert(address, index);
    }

    /// Mark an endpoint offline, keeping its record
    pub fn unregister(&self, address: SocketAddr) {
        let mut registry = self.registry();
        if let Some(index) = registry.online.remove(&address) {
            let record = &mut registry.clients[index];
            record.online = false;
            record.offline_time = Some(Utc::now());
        }
    }

    /// Count bytes delivered to a client
    pub fn add_rx(&self, address: SocketAddr, n: u64) {
        {
            let mut registry = self.registry();
            if let Some(&index) = registry.online.get(&address) {
                registry.clients[index].rx += n;
            }
        }
        self.add_rx_total(n);
    }

    /// Count bytes received from a client
    pub fn add_tx(&self, address: SocketAddr, n: u64) {
        {
            let mut registry = self.registry();
            if let Some(&index) = registry.online.get(&address) {
                registry.clients[index].tx += n;
            }
        }
        self.add_tx_total(n);
    }

    pub fn add_rx_total(&self, n: u64) {
        self.rx_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tx_total(&self, n: u64) {
        self.tx_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn rx_total(&self) -> u64 {
        self.rx_total.load(Ordering::Relaxed)
    }

    pub fn tx_total(&self) -> u64 {
        self.tx_total.load(Ordering::Relaxed)
    }

    /// The online record for an endpoint
    pub fn client(&self, address: SocketAddr) -> Option<ClientRecord> {
        let registry = self.registry();
        registry
            .online
            .get(&address)
            .map(|&index| registry.clients[index].clone())
    }

    /// Every record, online and offline
    pub fn clients(&self) -> Vec<ClientRecord> {
        self.registry().clients.clone()
    }

    pub fn online_count(&self) -> usize {
        self.registry().online.len()
    }

    /// Current throughput series, oldest first
    pub fn chart(&self) -> Vec<ChartSample> {
        self.chart_data().samples.iter().cloned().collect()
    }

    pub fn summary(&self) -> StatsSummary {
        let (online_clients, known_clients) = {
            let registry = self.registry();
            (registry.online.len(), registry.clients.len())
        };
        StatsSummary {
            online_clients,
            known_clients,
            rx_total: self.rx_total(),
            tx_total: self.tx_total(),
            chart_samples: self.chart_data().samples.len(),
        }
    }

    /// Take one throughput sample.
    ///
    /// Idle intervals (no bytes either way) are skipped rather than recorded
    /// as zeros. Returns whether a sample was appended.
    pub fn sample(&self) -> bool {
        let rx = self.rx_total();
        let tx = self.tx_total();

        let mut chart = self.chart_data();
        let receive_bytes = rx - chart.previous_rx;
        let transport_bytes = tx - chart.previous_tx;
        if receive_bytes == 0 && transport_bytes == 0 {
            return false;
        }

        if chart.samples.len() >= chart.capacity {
            chart.samples.pop_front();
        }
        chart.samples.push_back(ChartSample {
            transport_bytes,
            receive_bytes,
            label: chrono::Local::now().format("%H:%M:%S").to_string(),
        });
        chart.previous_rx = rx;
        chart.previous_tx = tx;
        true
    }

    /// Sample once per second until `cancel` fires
    pub async fn run_sampler(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sample();
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_rx_accumulates_per_client_and_globally() {
        let stats = Statistics::new();
        let client = addr("203.0.113.7:40000");
        stats.register(client);

        for _ in 0..3 {
            stats.add_rx(client, 100);
        }

        assert_eq!(stats.client(client).unwrap().rx, 300);
        assert_eq!(stats.rx_total(), 300);
        assert_eq!(stats.tx_total(), 0);
    }

    #[test]
    fn test_register_is_idempotent_while_online() {
        let stats = Statistics::new();
        let client = addr("203.0.113.7:40000");
        stats.register(client);
        stats.add_tx(client, 10);
        stats.register(client);

        assert_eq!(stats.clients().len(), 1);
        assert_eq!(stats.online_count(), 1);
        assert_eq!(stats.client(client).unwrap().tx, 10);
    }

    #[test]
    fn test_unregister_keeps_history() {
        let stats = Statistics::new();
        let client = addr("198.51.100.1:5555");
        stats.register(client);
        stats.add_rx(client, 42);
        stats.unregister(client);

        assert_eq!(stats.online_count(), 0);
        assert!(stats.client(client).is_none());
        let records = stats.clients();
        assert_eq!(records.len(), 1);
        assert!(!records[0].online);
        assert!(records[0].offline_time.is_some());
        assert_eq!(records[0].rx, 42);

        // Reconnecting from the same endpoint opens a fresh online record
        stats.register(client);
        assert_eq!(stats.clients().len(), 2);
        assert_eq!(stats.client(client).unwrap().rx, 0);

        // Traffic for an unknown endpoint still counts globally
        stats.add_tx(addr("192.0.2.9:1"), 5);
        assert_eq!(stats.tx_total(), 5);
    }

    #[test]
    fn test_idle_intervals_are_skipped() {
        let stats = Statistics::new();
        assert!(!stats.sample());

        stats.add_rx_total(100);
        stats.add_tx_total(40);
        assert!(stats.sample());
        assert!(!stats.sample());

        let chart = stats.chart();
        assert_eq!(chart.len(), 1);
        assert_eq!(chart[0].receive_bytes, 100);
        assert_eq!(chart[0].transport_bytes, 40);
        assert_eq!(chart[0].label.len(), 8);
    }

    #[test]
    fn test_chart_evicts_oldest_at_capacity() {
        let stats = Statistics::new();
        for i in 1..=(CHART_CAPACITY as u64 + 1) {
            stats.add_rx_total(i);
            assert!(stats.sample());
        }

        let chart = stats.chart();
        assert_eq!(chart.len(), CHART_CAPACITY);
        assert_eq!(chart.first().unwrap().receive_bytes, 2);
        assert_eq!(chart.last().unwrap().receive_bytes, CHART_CAPACITY as u64 + 1);
    }

    #[tokio::test]
    async fn test_sampler_stops_on_cancel() {
        let stats = Arc::new(Statistics::new());
        let cancel = CancellationToken::new();
        let sampler = tokio::spawn(Arc::clone(&stats).run_sampler(cancel.clone()));
        cancel.cancel();
        sampler.await.unwrap();
    }
}
