//! Candidate selection: pick one node from the active set for a request.
//!
//! Each active node contributes its best admissible capability; the score
//! trades cost against load with a small trust nudge, and ties fall back to
//! insertion order. Weighted candidate lists are memoized for one second
//! keyed on the registry generation.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::proto::{Capability, MODEL_AUTO, NodeDescriptor, QuoteRequest};

/// Weighted-candidate cache TTL.
pub const CANDIDATE_CACHE_TTL: Duration = Duration::from_secs(1);
/// Trust contribution per point.
const TRUST_WEIGHT: f64 = 0.01;

/// An active node annotated with its current trust.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: NodeDescriptor,
    pub trust: f64,
}

/// A scheduling decision: the node, the capability it will serve the
/// request with, and the quoted cost.
#[derive(Debug, Clone)]
pub struct Selection {
    pub node: NodeDescriptor,
    pub capability: Capability,
    pub cost_total: f64,
    pub score: f64,
}

/// Why no node could be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMiss {
    /// The active set is empty.
    NoNodes,
    /// Nodes exist, but none can serve this request.
    NoCapableNodes,
}

/// Rough token estimate for prompts: four bytes per token.
pub fn estimate_input_tokens(prompt: &str) -> u64 {
    (prompt.len() as u64).div_ceil(4)
}

/// Cost of serving `input`/`output` estimated tokens under `capability`.
pub fn capability_cost(capability: &Capability, input_tokens: u64, output_tokens: u64) -> f64 {
    capability.pricing.input_rate * input_tokens as f64
        + capability.pricing.output_rate * output_tokens as f64
}

/// The cheapest capability of `node` that can serve `request`, if any.
///
/// A capability is admissible when the model matches (`"auto"` matches
/// everything), the requested job type is advertised, and the context
/// window covers the combined token estimate.
pub fn best_capability(
    node: &NodeDescriptor,
    request: &QuoteRequest,
    input_tokens: u64,
    output_tokens: u64,
) -> Option<(Capability, f64)> {
    let mut best: Option<(Capability, f64)> = None;
    for capability in &node.capabilities {
        if request.model_id != MODEL_AUTO && capability.model_id != request.model_id {
            continue;
        }
        if let Some(job_type) = &request.job_type {
            let advertised = capability
                .job_types
                .as_ref()
                .is_some_and(|types| types.iter().any(|t| t == job_type));
            if !advertised {
                continue;
            }
        }
        if capability.context_window < input_tokens + output_tokens {
            continue;
        }
        let cost = capability_cost(capability, input_tokens, output_tokens);
        let cheaper = best.as_ref().is_none_or(|(_, c)| cost < *c);
        if cheaper {
            best = Some((capability.clone(), cost));
        }
    }
    best
}

fn load_factor(node: &NodeDescriptor) -> Option<f64> {
    if node.capacity.max_concurrent <= 0 {
        return None; // ineligible
    }
    Some(node.capacity.current_load as f64 / node.capacity.max_concurrent as f64)
}

/// Pick the best-scoring candidate for `request`.
///
/// `top_k` optionally prefilters to the cheapest K candidates before the
/// final scoring pass. Ties keep the earlier candidate.
pub fn select_node(
    candidates: &[Candidate],
    request: &QuoteRequest,
    top_k: Option<usize>,
) -> Result<Selection, SelectionMiss> {
    if candidates.is_empty() {
        return Err(SelectionMiss::NoNodes);
    }

    let input_tokens = estimate_input_tokens(&request.prompt);
    let output_tokens = request.max_tokens;

    let mut scored: Vec<Selection> = Vec::new();
    for candidate in candidates {
        let Some(load) = load_factor(&candidate.node) else {
            continue;
        };
        let Some((capability, cost)) =
            best_capability(&candidate.node, request, input_tokens, output_tokens)
        else {
            continue;
        };
        let score = -cost - load + candidate.trust * TRUST_WEIGHT;
        scored.push(Selection {
            node: candidate.node.clone(),
            capability,
            cost_total: cost,
            score,
        });
    }

    if scored.is_empty() {
        return Err(SelectionMiss::NoCapableNodes);
    }

    if let Some(k) = top_k {
        if scored.len() > k {
            // Stable: equal scores keep insertion order.
            scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(k);
        }
    }

    let mut best: Option<Selection> = None;
    for selection in scored {
        let better = best.as_ref().is_none_or(|b| selection.score > b.score);
        if better {
            best = Some(selection);
        }
    }
    best.ok_or(SelectionMiss::NoCapableNodes)
}

struct CacheSlot {
    generation: u64,
    built_at: Instant,
    candidates: Vec<Candidate>,
}

/// One-second memo of the weighted candidate list.
#[derive(Default)]
pub struct CandidateCache {
    slot: Mutex<Option<CacheSlot>>,
}

impl CandidateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached list for `generation`, or rebuild it via `build`.
    pub fn get_or_build(
        &self,
        generation: u64,
        build: impl FnOnce() -> Vec<Candidate>,
    ) -> Vec<Candidate> {
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(cached) = slot.as_ref() {
            if cached.generation == generation && cached.built_at.elapsed() < CANDIDATE_CACHE_TTL {
                return cached.candidates.clone();
            }
        }
        let candidates = build();
        *slot = Some(CacheSlot {
            generation,
            built_at: Instant::now(),
            candidates: candidates.clone(),
        });
        candidates
    }

    pub fn invalidate(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keys;
    use crate::proto::{NodeCapacity, PriceUnit, Pricing};

    fn node(node_id: &str, rate: f64, load: i64, max: i64) -> NodeDescriptor {
        NodeDescriptor {
            node_id: node_id.to_owned(),
            key_id: Keys::generate().npub(),
            endpoint: "http://127.0.0.1:1".parse().unwrap(),
            capacity: NodeCapacity {
                max_concurrent: max,
                current_load: load,
            },
            capabilities: vec![Capability {
                model_id: "mock".into(),
                context_window: 8192,
                max_tokens: 2048,
                pricing: Pricing {
                    unit: PriceUnit::Per1kTokens,
                    input_rate: rate,
                    output_rate: rate,
                    currency: "SAT".into(),
                },
                job_types: Some(vec!["inference".into()]),
                latency_estimate_ms: None,
            }],
            last_heartbeat_ms: None,
            trust_score: None,
        }
    }

    fn request(model: &str) -> QuoteRequest {
        QuoteRequest {
            request_id: "r".into(),
            model_id: model.into(),
            prompt: "hello there".into(),
            max_tokens: 16,
            temperature: None,
            top_p: None,
            job_type: None,
        }
    }

    fn candidates(nodes: Vec<NodeDescriptor>) -> Vec<Candidate> {
        nodes
            .into_iter()
            .map(|node| Candidate { node, trust: 50.0 })
            .collect()
    }

    #[test]
    fn empty_set_reports_no_nodes() {
        assert_eq!(
            select_node(&[], &request("mock")).map(|_| ()),
            Err(SelectionMiss::NoNodes)
        );
    }

    fn select_node(c: &[Candidate], r: &QuoteRequest) -> Result<Selection, SelectionMiss> {
        super::select_node(c, r, None)
    }

    #[test]
    fn wrong_model_reports_no_capable_nodes() {
        let c = candidates(vec![node("a", 0.0, 0, 4)]);
        assert!(matches!(
            select_node(&c, &request("other-model")),
            Err(SelectionMiss::NoCapableNodes)
        ));
    }

    #[test]
    fn cheaper_node_wins() {
        let c = candidates(vec![node("pricey", 2.0, 0, 4), node("cheap", 0.5, 0, 4)]);
        let selection = select_node(&c, &request("mock")).unwrap();
        assert_eq!(selection.node.node_id, "cheap");
    }

    #[test]
    fn less_loaded_node_wins_at_equal_price() {
        let c = candidates(vec![node("busy", 1.0, 3, 4), node("idle", 1.0, 0, 4)]);
        let selection = select_node(&c, &request("mock")).unwrap();
        assert_eq!(selection.node.node_id, "idle");
    }

    #[test]
    fn zero_capacity_is_ineligible() {
        let c = candidates(vec![node("none", 0.0, 0, 0)]);
        assert!(matches!(
            select_node(&c, &request("mock")),
            Err(SelectionMiss::NoCapableNodes)
        ));
    }

    #[test]
    fn ties_keep_insertion_order() {
        let c = candidates(vec![node("first", 1.0, 0, 4), node("second", 1.0, 0, 4)]);
        let selection = select_node(&c, &request("mock")).unwrap();
        assert_eq!(selection.node.node_id, "first");
    }

    #[test]
    fn auto_model_picks_cheapest_fit() {
        let mut multi = node("multi", 1.0, 0, 4);
        multi.capabilities.push(Capability {
            model_id: "premium".into(),
            context_window: 8192,
            max_tokens: 2048,
            pricing: Pricing {
                unit: PriceUnit::Per1kTokens,
                input_rate: 9.0,
                output_rate: 9.0,
                currency: "SAT".into(),
            },
            job_types: None,
            latency_estimate_ms: None,
        });
        let c = candidates(vec![multi]);
        let selection = select_node(&c, &request(MODEL_AUTO)).unwrap();
        assert_eq!(selection.capability.model_id, "mock");
    }

    #[test]
    fn job_type_must_be_advertised() {
        let c = candidates(vec![node("a", 0.0, 0, 4)]);
        let mut req = request("mock");
        req.job_type = Some("batch".into());
        assert!(matches!(
            select_node(&c, &req),
            Err(SelectionMiss::NoCapableNodes)
        ));
        req.job_type = Some("inference".into());
        assert!(select_node(&c, &req).is_ok());
    }

    #[test]
    fn context_window_gates_capability() {
        let mut small = node("small", 0.0, 0, 4);
        small.capabilities[0].context_window = 4;
        let c = candidates(vec![small]);
        assert!(matches!(
            select_node(&c, &request("mock")),
            Err(SelectionMiss::NoCapableNodes)
        ));
    }

    #[test]
    fn top_k_prefilter_still_selects_best() {
        let c = candidates(vec![
            node("a", 3.0, 0, 4),
            node("b", 2.0, 0, 4),
            node("c", 1.0, 0, 4),
        ]);
        let selection = super::select_node(&c, &request("mock"), Some(2)).unwrap();
        assert_eq!(selection.node.node_id, "c");
    }

    #[test]
    fn cache_reuses_within_generation() {
        let cache = CandidateCache::new();
        let first = cache.get_or_build(1, || candidates(vec![node("a", 1.0, 0, 4)]));
        assert_eq!(first.len(), 1);
        // Same generation: the builder must not run again.
        let second = cache.get_or_build(1, || panic!("must hit cache"));
        assert_eq!(second.len(), 1);
        // New generation rebuilds.
        let third = cache.get_or_build(2, Vec::new);
        assert!(third.is_empty());
    }
}
