//! Execution and stop order heuristics
//!
//! Sources come first so their data is flowing before consumers look at
//! it. There is no dependency resolution beyond that: everything else keeps
//! its registration order, cycles included.

use std::collections::HashSet;

use contracts::{ConnectionBlueprint, StopAfterRule};
use tracing::warn;

/// Order in which modules are prepared and started.
///
/// `modules` is the registration order. Modules without an input connected
/// to another registered module go first, then all others; both groups keep
/// their registration order.
pub fn execution_order(modules: &[String], connections: &[ConnectionBlueprint]) -> Vec<String> {
    let known: HashSet<&str> = modules.iter().map(String::as_str).collect();
    let fed: HashSet<&str> = connections
        .iter()
        .filter(|c| c.source != c.target && known.contains(c.source.as_str()))
        .map(|c| c.target.as_str())
        .collect();

    let (sources, consumers): (Vec<&String>, Vec<&String>) =
        modules.iter().partition(|name| !fed.contains(name.as_str()));
    sources.into_iter().chain(consumers).cloned().collect()
}

/// Order in which modules are stopped.
///
/// Follows the execution order, so producers stop first and their
/// end-of-stream reaches consumers before those are asked to stop. Each
/// rule then moves its module directly behind its `after` module.
pub fn stop_order(execution: &[String], rules: &[StopAfterRule]) -> Vec<String> {
    let mut order = execution.to_vec();
    for rule in rules {
        if rule.module == rule.after {
            warn!(module = %rule.module, "module cannot be stopped after itself, rule ignored");
            continue;
        }
        let Some(pos) = order.iter().position(|m| *m == rule.module) else {
            warn!(module = %rule.module, "stop-after rule names an unknown module");
            continue;
        };
        if !order.contains(&rule.after) {
            warn!(module = %rule.module, after = %rule.after, "stop-after target is unknown");
            continue;
        }

        let module = order.remove(pos);
        match order.iter().position(|m| *m == rule.after) {
            Some(after) => order.insert(after + 1, module),
            None => order.insert(pos, module),
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn conn(source: &str, target: &str) -> ConnectionBlueprint {
        ConnectionBlueprint {
            source: source.into(),
            output: "out".into(),
            target: target.into(),
            input: "in".into(),
        }
    }

    #[test]
    fn test_producers_first() {
        // registration order deliberately puts the consumer first
        let modules = names(&["rec", "amp", "cam"]);
        let connections = vec![conn("amp", "rec"), conn("cam", "rec")];
        assert_eq!(
            execution_order(&modules, &connections),
            names(&["amp", "cam", "rec"])
        );
    }

    #[test]
    fn test_consumers_keep_registration_order() {
        // no layering: c stays ahead of b although b feeds it
        let modules = names(&["c", "b", "a", "src2"]);
        let connections = vec![conn("a", "b"), conn("b", "c")];
        assert_eq!(
            execution_order(&modules, &connections),
            names(&["a", "src2", "c", "b"])
        );
    }

    #[test]
    fn test_cycle_is_tolerated() {
        let modules = names(&["src", "x", "y"]);
        let connections = vec![conn("src", "x"), conn("x", "y"), conn("y", "x")];
        assert_eq!(
            execution_order(&modules, &connections),
            names(&["src", "x", "y"])
        );
    }

    #[test]
    fn test_self_loop_and_unknown_sources_ignored() {
        let modules = names(&["filter"]);
        let connections = vec![conn("filter", "filter"), conn("gone", "filter")];
        assert_eq!(execution_order(&modules, &connections), names(&["filter"]));
    }

    #[test]
    fn test_stop_after_rule() {
        let exec = names(&["amp", "cam", "rec", "ui"]);
        let rules = vec![StopAfterRule {
            module: "ui".into(),
            after: "amp".into(),
        }];
        assert_eq!(stop_order(&exec, &rules), names(&["amp", "ui", "cam", "rec"]));
    }

    #[test]
    fn test_invalid_rules_are_skipped() {
        let exec = names(&["a", "b"]);
        let rules = vec![
            StopAfterRule {
                module: "zzz".into(),
                after: "a".into(),
            },
            StopAfterRule {
                module: "a".into(),
                after: "a".into(),
            },
            StopAfterRule {
                module: "b".into(),
                after: "missing".into(),
            },
        ];
        assert_eq!(stop_order(&exec, &rules), exec);
    }
}
