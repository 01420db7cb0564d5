//! Remediation Advisor
//!
//! Stateless lookup from (suspected node class, dominant metric) to a ranked
//! list of field actions. Unknown signatures are surfaced as `NoRuleMatched`
//! so operators learn about fault shapes the table does not cover.

use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use super::config::RuleConfig;
use super::error::{PnmError, PnmResult};
use crate::models::{
    ActionType, DeviceClass, FaultHypothesis, FaultScope, MetricType, RemediationAction,
};

/// Rule table keyed by fault signature
#[derive(Debug, Clone)]
pub struct RemediationAdvisor {
    rules: HashMap<(DeviceClass, MetricType), Vec<ActionType>>,
}

impl RemediationAdvisor {
    /// Empty table; every hypothesis is unmatched
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Field playbook for HFC plant
    pub fn with_default_rules() -> Self {
        use ActionType::*;
        use DeviceClass::*;
        use MetricType::*;

        let mut advisor = Self::new();

        // Amplifiers: gain/tilt and power problems show up on every metric
        advisor.add_rule(Amplifier, Noise, &[InspectAmplifierGainTilt, LocateIngressSource]);
        advisor.add_rule(Amplifier, Mer, &[InspectAmplifierGainTilt, LocateIngressSource]);
        advisor.add_rule(Amplifier, SignalLevel, &[InspectAmplifierGainTilt, CheckAmplifierPowerSupply]);
        advisor.add_rule(Amplifier, TxPower, &[InspectAmplifierGainTilt, CheckAmplifierPowerSupply]);
        advisor.add_rule(Amplifier, PacketLoss, &[CheckAmplifierPowerSupply, InspectAmplifierGainTilt]);
        advisor.add_rule(Amplifier, CodewordErrors, &[LocateIngressSource, InspectAmplifierGainTilt]);

        advisor.add_rule(Tap, SignalLevel, &[InspectTapPlate]);
        advisor.add_rule(Tap, Mer, &[InspectTapPlate, LocateIngressSource]);
        advisor.add_rule(Tap, Noise, &[LocateIngressSource, InspectTapPlate]);
        advisor.add_rule(Tap, CodewordErrors, &[InspectTapPlate, LocateIngressSource]);

        advisor.add_rule(FiberNode, SignalLevel, &[CheckOpticalLevels]);
        advisor.add_rule(FiberNode, Mer, &[CheckOpticalLevels, LocateIngressSource]);
        advisor.add_rule(FiberNode, Noise, &[LocateIngressSource, CheckOpticalLevels]);
        advisor.add_rule(FiberNode, PacketLoss, &[CheckOpticalLevels, CheckUpstreamCongestion]);
        advisor.add_rule(FiberNode, CodewordErrors, &[CheckOpticalLevels, LocateIngressSource]);

        advisor.add_rule(CmtsPort, PacketLoss, &[CheckUpstreamCongestion, ReviewCmtsPortConfig]);
        advisor.add_rule(CmtsPort, Noise, &[LocateIngressSource, ReviewCmtsPortConfig]);
        advisor.add_rule(CmtsPort, TxPower, &[ReviewCmtsPortConfig]);
        advisor.add_rule(CmtsPort, Mer, &[ReviewCmtsPortConfig, LocateIngressSource]);

        // Localized: the subscriber's own equipment or drop
        for class in [CableModem, SetTopBox] {
            advisor.add_rule(class, SignalLevel, &[InspectDropAndConnectors, RebootCustomerEquipment]);
            advisor.add_rule(class, TxPower, &[InspectDropAndConnectors, RebootCustomerEquipment]);
            advisor.add_rule(class, Noise, &[InspectDropAndConnectors]);
            advisor.add_rule(class, Mer, &[InspectDropAndConnectors, ReplaceCustomerEquipment]);
            advisor.add_rule(class, PacketLoss, &[RebootCustomerEquipment, ReplaceCustomerEquipment]);
            advisor.add_rule(class, CodewordErrors, &[InspectDropAndConnectors, ReplaceCustomerEquipment]);
        }

        advisor
    }

    /// Default playbook plus operator rules; operator rules replace defaults
    /// for the same signature
    pub fn with_extra_rules(extra: &[RuleConfig]) -> Self {
        let mut advisor = Self::with_default_rules();
        for rule in extra {
            advisor.add_rule(rule.node_class, rule.metric_type, &rule.actions);
        }
        advisor
    }

    pub fn add_rule(&mut self, class: DeviceClass, metric: MetricType, actions: &[ActionType]) {
        if actions.is_empty() {
            self.rules.remove(&(class, metric));
        } else {
            self.rules.insert((class, metric), actions.to_vec());
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Ranked actions for a hypothesis (rank 1 first)
    pub fn advise(&self, hypothesis: &FaultHypothesis) -> PnmResult<Vec<RemediationAction>> {
        let class = hypothesis.suspected_node_class;
        let dominant = hypothesis.dominant_metric();

        let actions = dominant
            .and_then(|metric| self.rules.get(&(class, metric)))
            .ok_or_else(|| {
                warn!(
                    node = %hypothesis.suspected_node_id,
                    class = %class,
                    metric = ?dominant,
                    "No remediation rule for fault signature"
                );
                PnmError::NoRuleMatched {
                    node_class: class,
                    metric_type: dominant,
                }
            })?;

        let metric = dominant.map(|m| m.as_str()).unwrap_or("UNKNOWN");
        let scope = match hypothesis.scope {
            FaultScope::Shared => format!(
                "{} devices under {}",
                hypothesis.distinct_devices, hypothesis.suspected_node_id
            ),
            FaultScope::Localized => format!(
                "{} only: localized, not shared",
                hypothesis.suspected_node_id
            ),
        };

        let ranked: Vec<RemediationAction> = actions
            .iter()
            .enumerate()
            .map(|(i, action)| {
                let rank = i as u32 + 1;
                RemediationAction {
                    id: Uuid::new_v5(&hypothesis.id, format!("action:{}", rank).as_bytes()),
                    fault_hypothesis_id: hypothesis.id,
                    action_type: *action,
                    rank,
                    rationale: format!(
                        "{} dominant at {} {} ({}, confidence {:.2}): {}",
                        metric,
                        class,
                        hypothesis.suspected_node_id,
                        scope,
                        hypothesis.confidence,
                        action.description()
                    ),
                }
            })
            .collect();

        debug!(
            hypothesis = %hypothesis.id,
            actions = ranked.len(),
            "Remediation advised"
        );

        Ok(ranked)
    }
}

impl Default for RemediationAdvisor {
    fn default() -> Self {
        Self::with_default_rules()
    }
}
