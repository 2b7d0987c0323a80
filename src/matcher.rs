//! Rule matching.
//!
//! Pure predicates: no I/O, no allocation beyond the returned list.

use crate::event::{ChangeEvent, OperationType};
use crate::rules::{AlertRule, RuleEventType};

/// True if `rule` applies to `event`.
#[must_use]
pub fn matches(rule: &AlertRule, event: &ChangeEvent) -> bool {
    if !rule.enabled {
        return false;
    }
    if let Some(db) = &rule.database {
        if *db != event.ns.db {
            return false;
        }
    }
    if let Some(coll) = &rule.collection {
        if *coll != event.ns.coll {
            return false;
        }
    }
    event_type_matches(rule.event_type, &event.operation_type)
}

/// True if the rule's event type filter admits `op`.
#[must_use]
pub fn event_type_matches(filter: RuleEventType, op: &OperationType) -> bool {
    match filter {
        RuleEventType::Upsert => matches!(
            op,
            OperationType::Insert | OperationType::Update | OperationType::Replace
        ),
        RuleEventType::Update => matches!(op, OperationType::Update | OperationType::Replace),
        RuleEventType::Insert => *op == OperationType::Insert,
        RuleEventType::Replace => *op == OperationType::Replace,
        RuleEventType::Delete => *op == OperationType::Delete,
    }
}

/// Rules from `rules` that apply to `event`, in their original order.
#[must_use]
pub fn matching_rules<'r>(rules: &'r [AlertRule], event: &ChangeEvent) -> Vec<&'r AlertRule> {
    rules.iter().filter(|r| matches(r, event)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_OPS: [OperationType; 4] = [
        OperationType::Insert,
        OperationType::Update,
        OperationType::Replace,
        OperationType::Delete,
    ];

    fn admitted(filter: RuleEventType) -> Vec<OperationType> {
        ALL_OPS
            .iter()
            .filter(|op| event_type_matches(filter, op))
            .cloned()
            .collect()
    }

    #[test]
    fn upsert_admits_writes_but_not_delete() {
        assert_eq!(
            admitted(RuleEventType::Upsert),
            vec![OperationType::Insert, OperationType::Update, OperationType::Replace]
        );
    }

    #[test]
    fn update_admits_update_and_replace() {
        assert_eq!(
            admitted(RuleEventType::Update),
            vec![OperationType::Update, OperationType::Replace]
        );
    }

    #[test]
    fn delete_and_insert_are_exact() {
        assert_eq!(admitted(RuleEventType::Delete), vec![OperationType::Delete]);
        assert_eq!(admitted(RuleEventType::Insert), vec![OperationType::Insert]);
        assert!(!event_type_matches(
            RuleEventType::Insert,
            &OperationType::Other("insert_many".to_string())
        ));
    }

    #[test]
    fn namespace_filters_apply_when_set() {
        let ev = ChangeEvent::new(OperationType::Insert, "shop", "orders", "1");

        let any = AlertRule::new("r", RuleEventType::Insert, "#c", "t");
        assert!(matches(&any, &ev));
        assert!(matches(&any.clone().in_database("shop").in_collection("orders"), &ev));
        assert!(!matches(&any.clone().in_database("crm"), &ev));
        assert!(!matches(&any.clone().in_collection("users"), &ev));
    }

    #[test]
    fn disabled_rule_never_matches() {
        let ev = ChangeEvent::new(OperationType::Insert, "shop", "orders", "1");
        let mut rule = AlertRule::new("r", RuleEventType::Insert, "#c", "t");
        rule.enabled = false;
        assert!(!matches(&rule, &ev));
    }

    #[test]
    fn matching_rules_preserves_order() {
        let ev = ChangeEvent::new(OperationType::Update, "shop", "orders", "1");
        let rules = vec![
            AlertRule::new("a", RuleEventType::Upsert, "#c", "t"),
            AlertRule::new("b", RuleEventType::Insert, "#c", "t"),
            AlertRule::new("c", RuleEventType::Update, "#c", "t"),
        ];
        let ids: Vec<&str> = matching_rules(&rules, &ev).iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
