//! Lightweight Prometheus-compatible metrics for the connection.
//!
//! Uses atomic counters for lock-free instrumentation on the packet paths.
//! `render` produces Prometheus text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters and gauges for one connection
pub struct Metrics {
    /// Data packets sent over UDP v4/v6 (counter)
    pub send_udp_total: AtomicU64,
    /// Data packets queued to a relay (counter)
    pub send_relay_total: AtomicU64,
    /// Relay writes dropped because the queue was full (counter)
    pub send_relay_queue_full_total: AtomicU64,
    /// Relay writes that failed in the transport (counter)
    pub send_relay_error_total: AtomicU64,
    /// Data packets received over IPv4 (counter)
    pub recv_data_ipv4_total: AtomicU64,
    /// Data packets received over IPv6 (counter)
    pub recv_data_ipv6_total: AtomicU64,
    /// Data packets received via relay (counter)
    pub recv_data_relay_total: AtomicU64,
    /// Disco pings/pongs/call-me-maybes sent (counters)
    pub disco_sent_ping_total: AtomicU64,
    pub disco_sent_pong_total: AtomicU64,
    pub disco_sent_call_me_maybe_total: AtomicU64,
    /// Disco pings/pongs/call-me-maybes received (counters)
    pub disco_recv_ping_total: AtomicU64,
    pub disco_recv_pong_total: AtomicU64,
    pub disco_recv_call_me_maybe_total: AtomicU64,
    /// Disco packets dropped: unknown key, box failure, parse failure (counters)
    pub disco_drop_unknown_key_total: AtomicU64,
    pub disco_drop_open_total: AtomicU64,
    pub disco_drop_parse_total: AtomicU64,
    /// Socket rebinds (counter)
    pub rebind_total: AtomicU64,
    /// Re-discovery requests (counter)
    pub restun_total: AtomicU64,
    /// Completed endpoint discovery passes (counter)
    pub update_endpoints_total: AtomicU64,
    /// Relay clients created (counter)
    pub relay_dial_total: AtomicU64,
    /// Open relay connections (gauge)
    pub relay_active: AtomicU64,
    /// Peers in the index (gauge)
    pub peers: AtomicU64,
    /// Creation time (for uptime calculation)
    pub start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            send_udp_total: AtomicU64::new(0),
            send_relay_total: AtomicU64::new(0),
            send_relay_queue_full_total: AtomicU64::new(0),
            send_relay_error_total: AtomicU64::new(0),
            recv_data_ipv4_total: AtomicU64::new(0),
            recv_data_ipv6_total: AtomicU64::new(0),
            recv_data_relay_total: AtomicU64::new(0),
            disco_sent_ping_total: AtomicU64::new(0),
            disco_sent_pong_total: AtomicU64::new(0),
            disco_sent_call_me_maybe_total: AtomicU64::new(0),
            disco_recv_ping_total: AtomicU64::new(0),
            disco_recv_pong_total: AtomicU64::new(0),
            disco_recv_call_me_maybe_total: AtomicU64::new(0),
            disco_drop_unknown_key_total: AtomicU64::new(0),
            disco_drop_open_total: AtomicU64::new(0),
            disco_drop_parse_total: AtomicU64::new(0),
            rebind_total: AtomicU64::new(0),
            restun_total: AtomicU64::new(0),
            update_endpoints_total: AtomicU64::new(0),
            relay_dial_total: AtomicU64::new(0),
            relay_active: AtomicU64::new(0),
            peers: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 20] = [
            ("pathsock_send_udp_total", "Data packets sent over UDP", &self.send_udp_total),
            ("pathsock_send_relay_total", "Data packets queued to a relay", &self.send_relay_total),
            ("pathsock_send_relay_queue_full_total", "Relay writes dropped on a full queue", &self.send_relay_queue_full_total),
            ("pathsock_send_relay_error_total", "Relay writes failed in transport", &self.send_relay_error_total),
            ("pathsock_recv_data_ipv4_total", "Data packets received over IPv4", &self.recv_data_ipv4_total),
            ("pathsock_recv_data_ipv6_total", "Data packets received over IPv6", &self.recv_data_ipv6_total),
            ("pathsock_recv_data_relay_total", "Data packets received via relay", &self.recv_data_relay_total),
            ("pathsock_disco_sent_ping_total", "Disco pings sent", &self.disco_sent_ping_total),
            ("pathsock_disco_sent_pong_total", "Disco pongs sent", &self.disco_sent_pong_total),
            ("pathsock_disco_sent_call_me_maybe_total", "Disco call-me-maybes sent", &self.disco_sent_call_me_maybe_total),
            ("pathsock_disco_recv_ping_total", "Disco pings received", &self.disco_recv_ping_total),
            ("pathsock_disco_recv_pong_total", "Disco pongs received", &self.disco_recv_pong_total),
            ("pathsock_disco_recv_call_me_maybe_total", "Disco call-me-maybes received", &self.disco_recv_call_me_maybe_total),
            ("pathsock_disco_drop_unknown_key_total", "Disco packets from unknown disco keys", &self.disco_drop_unknown_key_total),
            ("pathsock_disco_drop_open_total", "Disco packets that failed to open", &self.disco_drop_open_total),
            ("pathsock_disco_drop_parse_total", "Disco packets that failed to parse", &self.disco_drop_parse_total),
            ("pathsock_rebind_total", "UDP socket rebinds", &self.rebind_total),
            ("pathsock_restun_total", "Endpoint re-discovery requests", &self.restun_total),
            ("pathsock_update_endpoints_total", "Completed endpoint discovery passes", &self.update_endpoints_total),
            ("pathsock_relay_dial_total", "Relay clients created", &self.relay_dial_total),
        ];
        let gauges: [(&str, &str, &AtomicU64); 2] = [
            ("pathsock_relay_active", "Open relay connections", &self.relay_active),
            ("pathsock_peers", "Peers in the index", &self.peers),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        for (name, help, value) in gauges {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "# HELP pathsock_uptime_seconds Connection uptime in seconds\n\
             # TYPE pathsock_uptime_seconds gauge\n\
             pathsock_uptime_seconds {}\n",
            self.start_time.elapsed().as_secs()
        ));
        out
    }
}
