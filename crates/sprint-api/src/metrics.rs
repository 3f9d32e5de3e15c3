//! Prometheus text assembly.
//!
//! Counters stay owned by their components; this module only renders their
//! exports plus a few gauges derived from live snapshots.

use crate::GatewayContext;
use std::fmt::Write;

/// Render the full exposition body.
pub fn render(ctx: &GatewayContext) -> String {
    let mut out = String::with_capacity(4096);

    out.push_str(&ctx.gate.metrics.export());
    out.push_str(&ctx.dispatcher.metrics.export());
    out.push_str(&ctx.fanout.metrics.export());

    let totals = ctx.cache.totals();
    let _ = write!(
        out,
        r#"# HELP sprint_cache_entries Current cache entries across shards
# TYPE sprint_cache_entries gauge
sprint_cache_entries {}

# HELP sprint_cache_hits_total Cache hits
# TYPE sprint_cache_hits_total counter
sprint_cache_hits_total {}

# HELP sprint_cache_misses_total Cache misses
# TYPE sprint_cache_misses_total counter
sprint_cache_misses_total {}

# HELP sprint_cache_in_flight Current single-flight fetches
# TYPE sprint_cache_in_flight gauge
sprint_cache_in_flight {}

# HELP sprint_gate_audit_dropped_total Audit records dropped on overflow
# TYPE sprint_gate_audit_dropped_total counter
sprint_gate_audit_dropped_total {}
"#,
        totals.entries,
        totals.hits,
        totals.misses,
        totals.in_flight,
        ctx.gate.audit.dropped_count(),
    );

    for chain in ctx.relay.configured_chains() {
        if let Ok(health) = ctx.relay.health(chain) {
            let connected = health.peers.iter().filter(|p| p.last_heard_ms.is_some()).count();
            let _ = write!(
                out,
                r#"# HELP sprint_relay_peers Peers configured for a chain
# TYPE sprint_relay_peers gauge
sprint_relay_peers{{chain="{chain}"}} {}
sprint_relay_peers_heard{{chain="{chain}"}} {}
sprint_relay_synced{{chain="{chain}"}} {}
"#,
                health.peers.len(),
                connected,
                health.synced as u8,
            );
            if let Some(height) = health.height {
                let _ = write!(out, "sprint_relay_height{{chain=\"{chain}\"}} {height}\n");
            }
        }
    }

    out
}
