#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

/// Conditions on a rule; an absent field always matches.
#[derive(Debug, Clone, Default)]
pub struct Conditions {
    pub tool: Option<String>,
    pub key: Option<String>,
    pub ip: Option<String>,
    /// Millis-of-day after which the rule applies.
    pub after: Option<i64>,
    /// Millis-of-day before which the rule applies.
    pub before: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub name: String,
    pub effect: Effect,
    pub priority: i64,
    pub enabled: bool,
    pub conditions: Conditions,
}

/// Request attributes a rule's conditions are matched against.
pub struct PolicyContext<'a> {
    pub tool: &'a str,
    pub key: &'a str,
    pub ip: Option<&'a str>,
    /// Millis since UTC midnight, for `after`/`before` conditions.
    pub time_of_day_ms: i64,
}

pub struct PolicyDecision {
    pub effect: Effect,
    pub winning_rule: Option<String>,
    pub matching_rules: Vec<String>,
}

/// Ordered allow/deny evaluation. Scans every enabled rule whose
/// conditions all match; the highest-priority match wins, ties broken by
/// insertion order (earlier rule in `rules` wins). With no match, `default`
/// applies.
pub fn evaluate(rules: &[PolicyRule], ctx: &PolicyContext, default: Effect) -> PolicyDecision {
    let mut matching = Vec::new();
    let mut winner: Option<(usize, &PolicyRule)> = None;

    for (idx, rule) in rules.iter().enumerate() {
        if !rule.enabled || !conditions_match(&rule.conditions, ctx) {
            continue;
        }
        matching.push(rule.name.clone());
        let better = match &winner {
            None => true,
            Some((_, best)) => rule.priority > best.priority,
        };
        if better {
            winner = Some((idx, rule));
        }
    }

    match winner {
        Some((_, rule)) => PolicyDecision {
            effect: rule.effect,
            winning_rule: Some(rule.name.clone()),
            matching_rules: matching,
        },
        None => PolicyDecision {
            effect: default,
            winning_rule: None,
            matching_rules: matching,
        },
    }
}

fn conditions_match(c: &Conditions, ctx: &PolicyContext) -> bool {
    if let Some(tool) = &c.tool {
        if tool != ctx.tool {
            return false;
        }
    }
    if let Some(key) = &c.key {
        if key != ctx.key {
            return false;
        }
    }
    if let Some(ip) = &c.ip {
        if Some(ip.as_str()) != ctx.ip {
            return false;
        }
    }
    if let Some(after) = c.after {
        if ctx.time_of_day_ms < after {
            return false;
        }
    }
    if let Some(before) = c.before {
        if ctx.time_of_day_ms >= before {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, effect: Effect, priority: i64, tool: Option<&str>) -> PolicyRule {
        PolicyRule {
            name: name.to_string(),
            effect,
            priority,
            enabled: true,
            conditions: Conditions {
                tool: tool.map(String::from),
                ..Default::default()
            },
        }
    }

    fn ctx<'a>(tool: &'a str, key: &'a str) -> PolicyContext<'a> {
        PolicyContext {
            tool,
            key,
            ip: None,
            time_of_day_ms: 0,
        }
    }

    #[test]
    fn highest_priority_match_wins() {
        let rules = vec![
            rule("low", Effect::Allow, 1, Some("search")),
            rule("high", Effect::Deny, 10, Some("search")),
        ];
        let d = evaluate(&rules, &ctx("search", "k"), Effect::Allow);
        assert_eq!(d.effect, Effect::Deny);
        assert_eq!(d.winning_rule, Some("high".to_string()));
        assert_eq!(d.matching_rules.len(), 2);
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let rules = vec![
            rule("first", Effect::Allow, 5, Some("search")),
            rule("second", Effect::Deny, 5, Some("search")),
        ];
        let d = evaluate(&rules, &ctx("search", "k"), Effect::Deny);
        assert_eq!(d.winning_rule, Some("first".to_string()));
    }

    #[test]
    fn no_match_falls_back_to_default() {
        let rules = vec![rule("only", Effect::Deny, 1, Some("other"))];
        let d = evaluate(&rules, &ctx("search", "k"), Effect::Allow);
        assert_eq!(d.effect, Effect::Allow);
        assert!(d.winning_rule.is_none());
        assert!(d.matching_rules.is_empty());
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut r = rule("disabled", Effect::Deny, 100, Some("search"));
        r.enabled = false;
        let d = evaluate(&[r], &ctx("search", "k"), Effect::Allow);
        assert_eq!(d.effect, Effect::Allow);
    }

    #[test]
    fn time_window_conditions() {
        let rules = vec![PolicyRule {
            name: "business-hours".into(),
            effect: Effect::Deny,
            priority: 1,
            enabled: true,
            conditions: Conditions {
                after: Some(9 * 3_600_000),
                before: Some(17 * 3_600_000),
                ..Default::default()
            },
        }];
        let mut c = ctx("search", "k");
        c.time_of_day_ms = 10 * 3_600_000;
        assert_eq!(evaluate(&rules, &c, Effect::Allow).effect, Effect::Deny);
        c.time_of_day_ms = 20 * 3_600_000;
        assert_eq!(evaluate(&rules, &c, Effect::Allow).effect, Effect::Allow);
    }
}
