//! Candidate ordering and selection for the allocation dispatcher.

use crate::gameservers::NodeCounter;
use crate::resources::{GameServer, GameServerAllocationSpec, SchedulingStrategy};
use rand::seq::SliceRandom;
use rand::Rng;

/// Order the dispatcher's working slice.
///
/// Packed: servers on nodes carrying the most allocations first, so busy
/// nodes fill up and empty nodes can be reclaimed; ties break on node name
/// then server name so the order is stable. Distributed: one shuffle per
/// refresh, giving uniform selection.
pub fn sort_candidates(
    list: &mut [GameServer],
    scheduling: SchedulingStrategy,
    counter: &NodeCounter,
) {
    match scheduling {
        SchedulingStrategy::Packed => {
            list.sort_by(|a, b| {
                let allocated = |gs: &GameServer| counter.count(&gs.status.node_name).allocated;
                allocated(b)
                    .cmp(&allocated(a))
                    .then_with(|| a.status.node_name.cmp(&b.status.node_name))
                    .then_with(|| a.metadata.name.cmp(&b.metadata.name))
            });
        }
        SchedulingStrategy::Distributed => {
            list.shuffle(&mut rand::thread_rng());
        }
    }
}

/// Walk the ordered slice and pick the server to claim.
///
/// The first match for each `preferred` selector is tracked alongside the
/// first `required` match; the earliest-priority preferred winner is used,
/// falling back to the required match. With `top_n > 1` and no preferred
/// winner, the claim is sampled uniformly from the first N required matches
/// to spread contention under concurrent bursts.
pub fn find_game_server(
    list: &[GameServer],
    spec: &GameServerAllocationSpec,
    top_n: usize,
) -> Option<usize> {
    let mut required_matches: Vec<usize> = Vec::new();
    let mut preferred_matches: Vec<Option<usize>> = vec![None; spec.preferred.len()];
    let want_required = top_n.max(1);

    for (idx, gs) in list.iter().enumerate() {
        if !spec.required.matches(&gs.metadata.labels) {
            continue;
        }
        if required_matches.len() < want_required {
            required_matches.push(idx);
        }
        for (p, selector) in spec.preferred.iter().enumerate() {
            if preferred_matches[p].is_none() && selector.matches(&gs.metadata.labels) {
                preferred_matches[p] = Some(idx);
            }
        }
        if required_matches.len() >= want_required && preferred_matches.iter().all(Option::is_some)
        {
            break;
        }
    }

    if let Some(idx) = preferred_matches.into_iter().flatten().next() {
        return Some(idx);
    }
    match required_matches.len() {
        0 => None,
        1 => Some(required_matches[0]),
        n => Some(required_matches[rand::thread_rng().gen_range(0..n)]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{GameServerState, LabelSelector, Metadata};
    use crate::store::Store;
    use tokio::sync::watch;

    fn labelled(name: &str, labels: &[(&str, &str)]) -> GameServer {
        let mut gs = GameServer {
            metadata: Metadata::named("default", name),
            ..GameServer::default()
        };
        gs.status.state = GameServerState::Ready;
        for (k, v) in labels {
            gs.metadata.labels.insert(k.to_string(), v.to_string());
        }
        gs
    }

    fn spec(required: LabelSelector, preferred: Vec<LabelSelector>) -> GameServerAllocationSpec {
        GameServerAllocationSpec {
            required,
            preferred,
            ..GameServerAllocationSpec::default()
        }
    }

    #[test]
    fn required_match_wins_without_preferences() {
        let list = vec![
            labelled("a", &[("fleet", "other")]),
            labelled("b", &[("fleet", "simple")]),
        ];
        let spec = spec(LabelSelector::from_label("fleet", "simple"), vec![]);
        assert_eq!(find_game_server(&list, &spec, 1), Some(1));
    }

    #[test]
    fn preferred_order_outranks_position() {
        let list = vec![
            labelled("a", &[("fleet", "simple")]),
            labelled("b", &[("fleet", "simple"), ("gpu", "yes")]),
            labelled("c", &[("fleet", "simple"), ("ssd", "yes")]),
        ];
        // Second preference appears earlier in the list, but the first
        // preference still wins.
        let spec = spec(
            LabelSelector::from_label("fleet", "simple"),
            vec![
                LabelSelector::from_label("gpu", "yes"),
                LabelSelector::from_label("ssd", "yes"),
            ],
        );
        assert_eq!(find_game_server(&list, &spec, 1), Some(1));
    }

    #[test]
    fn no_match_is_none() {
        let list = vec![labelled("a", &[("fleet", "other")])];
        let spec = spec(LabelSelector::from_label("fleet", "simple"), vec![]);
        assert_eq!(find_game_server(&list, &spec, 1), None);
    }

    #[test]
    fn top_n_samples_within_the_head() {
        let list: Vec<GameServer> = (0..10)
            .map(|i| labelled(&format!("gs-{i}"), &[("fleet", "simple")]))
            .collect();
        let spec = spec(LabelSelector::from_label("fleet", "simple"), vec![]);
        for _ in 0..50 {
            let idx = find_game_server(&list, &spec, 3).unwrap();
            assert!(idx < 3, "sampled index {idx} outside top-3");
        }
    }

    #[tokio::test]
    async fn packed_sort_prefers_busy_nodes() {
        let store = Store::new();
        let (_tx, shutdown) = watch::channel(false);
        let counter = NodeCounter::start(store.clone(), shutdown);

        // node-busy carries an allocated server.
        let mut allocated = labelled("busy-session", &[]);
        allocated.status.state = GameServerState::Allocated;
        allocated.status.node_name = "node-busy".to_string();
        store.game_servers.create(allocated).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut quiet = labelled("on-quiet", &[]);
        quiet.status.node_name = "node-quiet".to_string();
        let mut busy = labelled("on-busy", &[]);
        busy.status.node_name = "node-busy".to_string();

        let mut list = vec![quiet, busy];
        sort_candidates(&mut list, SchedulingStrategy::Packed, &counter);
        assert_eq!(list[0].metadata.name, "on-busy");
    }
}
