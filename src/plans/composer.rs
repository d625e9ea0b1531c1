//! Conditional plan composer.
//!
//! A braided review whose cluster statistics clear the promotion gates is
//! distilled into a `conditional_plan` strand: activation/invalidation
//! conditions, entry/exit criteria, risk caps and full provenance. Plans
//! are immutable; revisions are new strands referencing their
//! predecessors. The doctrine check is consulted through a port; the
//! doctrine process itself lives outside the core.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::{CilError, CilResult};
use crate::models::{
    Config, ConditionalPlanContent, PlanConditions, PlanProvenance, PlanRisk, PlanScope,
    ReviewContent, Strand, StrandKind,
};
use crate::store::{StrandFilter, StrandStore};

pub const TAG_PLAN: &str = "cil:plan";

/// External doctrine consult. The in-repo default permits everything.
pub trait DoctrinePort: Send + Sync {
    fn is_contraindicated(&self, braid: &Strand) -> bool;
}

pub struct PermissiveDoctrine;

impl DoctrinePort for PermissiveDoctrine {
    fn is_contraindicated(&self, _braid: &Strand) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct PlanComposer {
    store: StrandStore,
    doctrine: Arc<dyn DoctrinePort>,
    config: Config,
}

impl PlanComposer {
    pub fn new(store: StrandStore, doctrine: Arc<dyn DoctrinePort>, config: Config) -> Self {
        Self {
            store,
            doctrine,
            config,
        }
    }

    /// Promote the braid if it clears the gates. Returns the plan id, or
    /// `None` when a gate (or prior promotion) blocks it.
    pub async fn try_promote(&self, braid_id: &str) -> CilResult<Option<String>> {
        let braid = self.store.get(braid_id).await?;
        if braid.kind != StrandKind::PredictionReview || braid.braid_level < 2 {
            return Err(CilError::ValidationFailure(
                "only braided reviews can be promoted".to_string(),
            ));
        }
        let content: ReviewContent = braid.content_as()?;
        let Some(aggregates) = content.braid.clone() else {
            return Err(CilError::ValidationFailure(
                "braid without aggregates".to_string(),
            ));
        };

        // One plan per braid: a prior promotion blocks re-promotion.
        let existing = self
            .store
            .query(&StrandFilter::new().kind(StrandKind::ConditionalPlan))
            .await?;
        if existing
            .iter()
            .any(|p| p.lineage.parent_ids.contains(&braid.id))
        {
            debug!(braid = %braid_id, "already promoted");
            return Ok(None);
        }

        let (braid_ids, review_ids) = self.walk_lineage(&braid).await?;

        if review_ids.len() < self.config.plan_min_members {
            debug!(
                braid = %braid_id,
                contributing = review_ids.len(),
                "below member gate"
            );
            return Ok(None);
        }

        let avg_selection = self.average_selection(&braid, &review_ids).await?;
        if avg_selection < self.config.plan_min_selection {
            debug!(braid = %braid_id, avg_selection, "below selection gate");
            return Ok(None);
        }

        if self.doctrine.is_contraindicated(&braid) {
            info!(braid = %braid_id, "doctrine contraindicated, not promoting");
            return Ok(None);
        }

        let plan_content = compose_plan(&braid, &content, &aggregates, braid_ids, review_ids);
        let plan = Strand::new(StrandKind::ConditionalPlan)
            .with_content(&plan_content)
            .with_tag(TAG_PLAN)
            .with_lineage(vec![braid.id.clone()], "promoted from braid");
        let plan = match &braid.symbol {
            Some(symbol) => plan.with_symbol(symbol.clone()),
            None => plan,
        };

        let plan_id = self.store.append(&plan).await?;
        info!(
            plan = %plan_id,
            braid = %braid_id,
            success_rate = aggregates.success_rate,
            "conditional plan promoted"
        );
        Ok(Some(plan_id))
    }

    /// Collect the braid chain and the contributing leaf review ids.
    async fn walk_lineage(&self, braid: &Strand) -> CilResult<(Vec<String>, Vec<String>)> {
        let mut braid_ids = vec![braid.id.clone()];
        let mut review_ids = Vec::new();
        let mut queue: VecDeque<String> = braid.lineage.parent_ids.iter().cloned().collect();

        while let Some(id) = queue.pop_front() {
            let strand = self.store.get(&id).await?;
            if strand.braid_level <= 1 {
                review_ids.push(strand.id);
            } else {
                braid_ids.push(strand.id.clone());
                queue.extend(strand.lineage.parent_ids.iter().cloned());
            }
        }
        review_ids.sort_unstable();
        review_ids.dedup();
        Ok((braid_ids, review_ids))
    }

    /// Mean selection over the contributing reviews; unscored members count
    /// 0.5. The braid's own score joins the average when present.
    async fn average_selection(&self, braid: &Strand, review_ids: &[String]) -> CilResult<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        if braid.scores.selection > 0.0 {
            sum += braid.scores.selection;
            count += 1;
        }
        for id in review_ids {
            let strand = self.store.get(id).await?;
            sum += if strand.scores.selection > 0.0 {
                strand.scores.selection
            } else {
                0.5
            };
            count += 1;
        }
        Ok(if count == 0 { 0.0 } else { sum / count as f64 })
    }
}

fn compose_plan(
    braid: &Strand,
    content: &ReviewContent,
    aggregates: &crate::models::BraidAggregates,
    braid_ids: Vec<String>,
    review_ids: Vec<String>,
) -> ConditionalPlanContent {
    let timeframes = content.timeframes.clone();
    let tf_list = timeframes
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(",");

    let activation = vec![
        format!(
            "{} group forms with patterns [{}] on [{tf_list}]",
            content.group_type.as_str(),
            content.pattern_types.join(","),
        ),
        format!(
            "historical success rate {:.2} over {} reviews",
            aggregates.success_rate, aggregates.member_count
        ),
    ];
    let invalidation = vec![
        format!(
            "adverse move exceeds {:.2}%",
            content.outcome.max_adverse_pct
        ),
        "constituent patterns no longer present".to_string(),
    ];

    let entry_criteria = vec![
        "enter within one bar of group formation".to_string(),
        format!("expected move {:+.2}%", aggregates.avg_return_pct),
    ];
    let exit_criteria = vec![
        format!("target {:+.2}%", aggregates.avg_return_pct.max(0.1)),
        format!("stop {:.2}% adverse", content.outcome.max_adverse_pct.max(0.1)),
        format!(
            "time exit after {}s without resolution",
            content.outcome.time_to_outcome_secs.max(60)
        ),
    ];

    // Edge-proportional sizing with a hard cap; drawdown cap from the
    // observed worst excursion.
    let edge = (2.0 * aggregates.success_rate - 1.0).max(0.0);
    let risk = PlanRisk {
        sizing_pct: (edge * 10.0).clamp(0.25, 5.0),
        max_drawdown_pct: (content.outcome.max_adverse_pct * 1.5).clamp(0.5, 20.0),
    };

    let expected_rr = if content.outcome.max_adverse_pct > 0.0 {
        (aggregates.avg_return_pct / content.outcome.max_adverse_pct).max(0.0)
    } else {
        aggregates.avg_return_pct.max(0.0)
    };

    ConditionalPlanContent {
        conditions: PlanConditions {
            activation,
            invalidation,
        },
        entry_criteria,
        exit_criteria,
        risk,
        scope: PlanScope {
            assets: braid.symbol.iter().cloned().collect(),
            timeframes,
            regimes: braid.regime.iter().cloned().collect(),
        },
        provenance: PlanProvenance {
            braid_ids,
            review_ids,
            experiment_ids: Vec::new(),
        },
        expected_rr,
    }
}
