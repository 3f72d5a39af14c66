use crate::{
    engine::inventory::availability::CalculationType,
    rule::{
        Action, Attribute, CalculationRule, Condition, ConditionValue, DecisionStatus,
        FactContext, LogicalOp, Op, RuleName, RuleState, ScaleField, Value,
    },
};
use chrono::NaiveDate;
use fnv::FnvHashMap;
use garner_instrument::{market::Market, security::Temperature};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{cmp::Reverse, sync::Arc};
use thiserror::Error;
use tracing::info;

/// Errors raised when compiling a rule-set.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum RuleCompileError {
    #[error("rule {rule}: unknown attribute '{attribute}'")]
    UnknownAttribute { rule: RuleName, attribute: SmolStr },

    #[error("rule {rule}: operator {op:?} requires an operand")]
    MissingOperand { rule: RuleName, op: Op },
}

#[derive(Debug, Clone, PartialEq)]
struct CompiledCondition {
    attribute: Attribute,
    op: Op,
    operand: ConditionValue,
    logical: LogicalOp,
}

#[derive(Debug, Clone, PartialEq)]
struct CompiledRule {
    name: RuleName,
    version: u32,
    rule_type: CalculationType,
    market: Option<Market>,
    priority: u32,
    effective: NaiveDate,
    expiry: Option<NaiveDate>,
    conditions: Vec<CompiledCondition>,
    actions: Vec<Action>,
}

impl CompiledRule {
    fn applies(&self, market: Market, date: NaiveDate) -> bool {
        self.market.is_none_or(|rule_market| rule_market == market)
            && self.effective <= date
            && self.expiry.is_none_or(|expiry| date <= expiry)
    }

    /// Left-to-right boolean fold over the condition terms.
    fn matches(&self, ctx: &FactContext) -> bool {
        let mut result: Option<bool> = None;
        for condition in &self.conditions {
            let term = evaluate_condition(condition, ctx);
            result = Some(match (result, condition.logical) {
                (None, _) => term,
                (Some(acc), LogicalOp::And) => acc && term,
                (Some(acc), LogicalOp::Or) => acc || term,
            });
        }
        result.unwrap_or(true)
    }
}

fn evaluate_condition(condition: &CompiledCondition, ctx: &FactContext) -> bool {
    let fact = ctx.get(condition.attribute);

    if condition.op == Op::Exists {
        return fact.is_some();
    }

    // Missing attributes fail every operator except Exists
    let Some(fact) = fact else {
        return false;
    };

    match (condition.op, &condition.operand) {
        (Op::Eq, ConditionValue::One(operand)) => fact == operand,
        (Op::Ne, ConditionValue::One(operand)) => fact != operand,
        (Op::Lt, ConditionValue::One(operand)) => numeric_cmp(fact, operand, |ord| ord.is_lt()),
        (Op::Le, ConditionValue::One(operand)) => numeric_cmp(fact, operand, |ord| ord.is_le()),
        (Op::Gt, ConditionValue::One(operand)) => numeric_cmp(fact, operand, |ord| ord.is_gt()),
        (Op::Ge, ConditionValue::One(operand)) => numeric_cmp(fact, operand, |ord| ord.is_ge()),
        (Op::In, ConditionValue::Many(operands)) => operands.contains(fact),
        (Op::NotIn, ConditionValue::Many(operands)) => !operands.contains(fact),
        (Op::Matches, ConditionValue::One(operand)) => match (fact.as_text(), operand.as_text()) {
            (Some(text), Some(pattern)) => wildcard_match(pattern, text),
            _ => false,
        },
        // Operand arity mismatches are rejected at compile time; anything else is no match
        _ => false,
    }
}

fn numeric_cmp(
    fact: &Value,
    operand: &Value,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    match (fact.as_number(), operand.as_number()) {
        (Some(fact), Some(operand)) => accept(fact.cmp(&operand)),
        _ => false,
    }
}

/// Case-sensitive `*`-wildcard match.
///
/// The first and last pattern segments anchor to the start and end of the text; middle
/// segments must occur in order between them.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = parts.split_first().expect("split yields at least one part");
    let (last, middle) = rest.split_last().expect("pattern contains '*'");

    let Some(remainder) = text.strip_prefix(first) else {
        return false;
    };
    let Some(mut remainder) = remainder.strip_suffix(last) else {
        return false;
    };

    for part in middle {
        if part.is_empty() {
            continue;
        }
        match remainder.find(part) {
            Some(found) => remainder = &remainder[found + part.len()..],
            None => return false,
        }
    }
    true
}

/// Accumulated effect of a rule chain on a single evaluated context.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub included: bool,
    pub decision: Option<DecisionStatus>,
    pub temperature: Option<Temperature>,
    pub borrow_rate: Option<Decimal>,
    pub gross_factor: Decimal,
    pub available_factor: Decimal,
    pub overborrow: bool,
    /// `(name, version)` of the last rule that matched, recorded on produced records.
    pub matched: Option<(RuleName, u32)>,
}

impl Default for RuleOutcome {
    fn default() -> Self {
        Self {
            included: true,
            decision: None,
            temperature: None,
            borrow_rate: None,
            gross_factor: Decimal::ONE,
            available_factor: Decimal::ONE,
            overborrow: false,
            matched: None,
        }
    }
}

impl RuleOutcome {
    /// Execute a matched rule's actions in declared order. Returns true if the chain stops.
    fn apply(&mut self, rule: &CompiledRule) -> bool {
        self.matched = Some((rule.name.clone(), rule.version));
        for action in &rule.actions {
            match action {
                Action::Include => self.included = true,
                Action::Exclude => self.included = false,
                Action::SetStatus(status) => self.decision = Some(*status),
                Action::SetTemperature(temperature) => self.temperature = Some(*temperature),
                Action::SetBorrowRate(rate) => self.borrow_rate = Some(*rate),
                Action::Scale { field, factor } => match field {
                    ScaleField::Gross => self.gross_factor *= factor,
                    ScaleField::Available => self.available_factor *= factor,
                },
                Action::MarkOverborrow => self.overborrow = true,
                Action::Stop => return true,
            }
        }
        false
    }
}

/// Immutable, evaluable compilation of the active rules, indexed by calculation type.
///
/// Construct via [`compile`]; never mutated after construction. Updates build a fresh set and
/// swap it into the [`RuleSetHandle`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledRuleSet {
    by_type: FnvHashMap<CalculationType, Vec<CompiledRule>>,
}

impl CompiledRuleSet {
    /// Evaluate the applicable rule chain for `rule_type` against the provided context.
    ///
    /// Rules apply if `Active`, their market matches (or is unset), and their effective range
    /// brackets the business date; they evaluate in ascending priority, ties broken by
    /// descending version. An empty or entirely unmatched chain yields the default outcome:
    /// included, quantities unchanged.
    pub fn evaluate(
        &self,
        rule_type: CalculationType,
        market: Market,
        business_date: NaiveDate,
        ctx: &FactContext,
    ) -> RuleOutcome {
        let mut outcome = RuleOutcome::default();

        let Some(rules) = self.by_type.get(&rule_type) else {
            return outcome;
        };

        for rule in rules {
            if !rule.applies(market, business_date) || !rule.matches(ctx) {
                continue;
            }
            if outcome.apply(rule) {
                break;
            }
        }

        outcome
    }

    pub fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.values().all(Vec::is_empty)
    }
}

/// Compile `Active` rules into an immutable [`CompiledRuleSet`].
pub fn compile(rules: Vec<CalculationRule>) -> Result<CompiledRuleSet, RuleCompileError> {
    let mut by_type: FnvHashMap<CalculationType, Vec<CompiledRule>> = FnvHashMap::default();

    for rule in rules {
        if rule.state != RuleState::Active {
            continue;
        }

        let compiled = compile_rule(rule)?;
        by_type.entry(compiled.rule_type).or_default().push(compiled);
    }

    for rules in by_type.values_mut() {
        rules.sort_by_key(|rule| (rule.priority, Reverse(rule.version)));
    }

    Ok(CompiledRuleSet { by_type })
}

fn compile_rule(rule: CalculationRule) -> Result<CompiledRule, RuleCompileError> {
    let conditions = rule
        .conditions
        .into_iter()
        .map(|condition| compile_condition(&rule.name, condition))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledRule {
        name: rule.name,
        version: rule.version,
        rule_type: rule.rule_type,
        market: rule.market,
        priority: rule.priority,
        effective: rule.effective,
        expiry: rule.expiry,
        conditions,
        actions: rule.actions,
    })
}

fn compile_condition(
    rule: &RuleName,
    condition: Condition,
) -> Result<CompiledCondition, RuleCompileError> {
    let attribute = Attribute::from_name(&condition.attribute).ok_or_else(|| {
        RuleCompileError::UnknownAttribute {
            rule: rule.clone(),
            attribute: condition.attribute.clone(),
        }
    })?;

    let operand_ok = match condition.op {
        Op::Exists => true,
        Op::In | Op::NotIn => matches!(condition.value, ConditionValue::Many(_)),
        _ => matches!(condition.value, ConditionValue::One(_)),
    };
    if !operand_ok {
        return Err(RuleCompileError::MissingOperand {
            rule: rule.clone(),
            op: condition.op,
        });
    }

    Ok(CompiledCondition {
        attribute,
        op: condition.op,
        operand: condition.value,
        logical: condition.logical.unwrap_or(LogicalOp::And),
    })
}

/// Shared handle to the active [`CompiledRuleSet`].
///
/// Readers take a cheap `Arc` clone of the current set; [`swap`](Self::swap) replaces the
/// pointer atomically, so an evaluator observes either the old complete set or the new one,
/// never a mixture.
#[derive(Debug, Clone, Default)]
pub struct RuleSetHandle {
    inner: Arc<parking_lot::RwLock<Arc<CompiledRuleSet>>>,
}

impl RuleSetHandle {
    pub fn new(set: CompiledRuleSet) -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(Arc::new(set))),
        }
    }

    pub fn load(&self) -> Arc<CompiledRuleSet> {
        Arc::clone(&self.inner.read())
    }

    pub fn swap(&self, set: CompiledRuleSet) {
        let rules = set.len();
        *self.inner.write() = Arc::new(set);
        info!(rules, "active rule-set swapped");
    }
}
