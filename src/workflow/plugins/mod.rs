// =============================================================================
// Built-in Plugins — the standard decision pipeline
// =============================================================================
//
//   coins_pick      select candidate symbols from the catalogue
//   market_state    indicators per symbol from cached market data
//   quant_filter    weighted scoring gate ahead of the AI stages
//   batch_decision  multi-role debate producing the portfolio decision
//   risk_check      explicit risk validation node (optional; the execution
//                   node validates inline when this one is absent)
//   execution       orders out, trade history in
// =============================================================================

pub mod coins_pick;
pub mod debate_node;
pub mod execution_node;
pub mod market_state;
pub mod quant_filter;
pub mod risk_check;

use crate::workflow::registry::PluginRegistry;

/// Install every built-in plugin into the registry.
pub fn register_builtins(registry: &mut PluginRegistry) {
    registry.register(coins_pick::metadata(), coins_pick::construct);
    registry.register(market_state::metadata(), market_state::construct);
    registry.register(quant_filter::metadata(), quant_filter::construct);
    registry.register(debate_node::metadata(), debate_node::construct);
    registry.register(risk_check::metadata(), risk_check::construct);
    registry.register(execution_node::metadata(), execution_node::construct);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_register_under_their_wire_names() {
        let registry = PluginRegistry::with_builtins();
        for name in [
            "coins_pick",
            "market_state",
            "quant_filter",
            "batch_decision",
            "risk_check",
            "execution",
        ] {
            assert!(registry.contains(name), "missing plugin {name}");
        }
    }

    #[test]
    fn metadata_orders_follow_the_standard_chain() {
        let registry = PluginRegistry::with_builtins();
        let list = registry.metadata_list();
        let names: Vec<&str> = list.iter().map(|m| m.name.as_str()).collect();
        let pos = |n: &str| names.iter().position(|&x| x == n).unwrap();
        assert!(pos("coins_pick") < pos("market_state"));
        assert!(pos("market_state") < pos("quant_filter"));
        assert!(pos("quant_filter") < pos("batch_decision"));
        assert!(pos("batch_decision") < pos("execution"));
    }
}
