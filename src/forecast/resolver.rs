//! Leader/follower resolution over `weather_ref` chains.

use crate::client::{ClientId, Position};
use crate::error::ConfigurationError;
use std::collections::{BTreeMap, HashSet};

/// Follows `weather_ref` from `start` until a leader is reached.
///
/// `lookup(id)` returns `None` for an unknown client, `Some(None)` for a
/// leader and `Some(Some(next))` for a follower. The walk visits each id at
/// most once and never more than `fleet_size` ids.
pub fn resolve_leader<F>(
    start: ClientId,
    fleet_size: usize,
    lookup: F,
) -> Result<ClientId, ConfigurationError>
where
    F: Fn(ClientId) -> Option<Option<ClientId>>,
{
    let mut chain: Vec<ClientId> = Vec::new();
    let mut visited = HashSet::new();
    let mut current = start;

    loop {
        if !visited.insert(current) {
            chain.push(current);
            return Err(ConfigurationError::WeatherCycle(chain));
        }

        let next = match lookup(current) {
            Some(next) => next,
            None => {
                let from = chain.last().copied().unwrap_or(current);
                return Err(ConfigurationError::DanglingWeatherRef { from, to: current });
            }
        };

        chain.push(current);
        if chain.len() > fleet_size {
            return Err(ConfigurationError::WeatherCycle(chain));
        }

        match next {
            None => return Ok(current),
            Some(next) => current = next,
        }
    }
}

/// Leaders with their followers, plus clients whose chain could not resolve.
#[derive(Debug, Default, PartialEq)]
pub struct ForecastPlan {
    pub leaders: BTreeMap<ClientId, Vec<ClientId>>,
    pub unresolved: Vec<(ClientId, ConfigurationError)>,
}

/// Resolves every client in `refs` (id -> its `weather_ref`).
pub fn plan_forecasts(refs: &BTreeMap<ClientId, Option<ClientId>>) -> ForecastPlan {
    let mut plan = ForecastPlan::default();
    let lookup = |id: ClientId| refs.get(&id).copied();

    for (&id, weather_ref) in refs {
        if weather_ref.is_none() {
            plan.leaders.entry(id).or_default();
            continue;
        }
        match resolve_leader(id, refs.len(), lookup) {
            Ok(leader) => plan.leaders.entry(leader).or_default().push(id),
            Err(e) => plan.unresolved.push((id, e)),
        }
    }
    plan
}

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance (haversine).
pub fn distance_km(a: &Position, b: &Position) -> f64 {
    let (phi1, phi2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dphi = (b.latitude - a.latitude).to_radians();
    let dlambda = (b.longitude - a.longitude).to_radians();
    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Folds each leader lying within `radius_km` of an earlier leader into the
/// closest such group, followers included. Leaders are visited in id order
/// and only group heads attract others. A non-positive radius is a no-op.
pub fn group_nearby(
    plan: ForecastPlan,
    positions: &BTreeMap<ClientId, Position>,
    radius_km: f64,
) -> ForecastPlan {
    if !(radius_km > 0.0) {
        return plan;
    }
    let mut grouped = ForecastPlan {
        leaders: BTreeMap::new(),
        unresolved: plan.unresolved,
    };
    let mut heads: Vec<(ClientId, &Position)> = Vec::new();

    for (leader, followers) in plan.leaders {
        let position = positions.get(&leader);
        let nearest = position.and_then(|at| {
            heads
                .iter()
                .map(|(head, head_at)| (*head, distance_km(at, head_at)))
                .filter(|(_, km)| *km <= radius_km)
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(head, _)| head)
        });
        match nearest {
            Some(head) => {
                let group = grouped.leaders.entry(head).or_default();
                group.push(leader);
                group.extend(followers);
            }
            None => {
                if let Some(at) = position {
                    heads.push((leader, at));
                }
                grouped.leaders.insert(leader, followers);
            }
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(i64, Option<i64>)]) -> BTreeMap<ClientId, Option<ClientId>> {
        edges
            .iter()
            .map(|(id, r)| (ClientId(*id), r.map(ClientId)))
            .collect()
    }

    #[test]
    fn test_chain_resolves_to_leader() {
        let g = graph(&[(1, None), (2, Some(1)), (3, Some(2))]);
        let leader = resolve_leader(ClientId(3), g.len(), |id| g.get(&id).copied()).unwrap();
        assert_eq!(leader, ClientId(1));
    }

    #[test]
    fn test_two_cycle_detected() {
        let g = graph(&[(1, Some(2)), (2, Some(1))]);
        let err = resolve_leader(ClientId(1), g.len(), |id| g.get(&id).copied()).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::WeatherCycle(vec![ClientId(1), ClientId(2), ClientId(1)])
        );
    }

    #[test]
    fn test_tail_into_cycle_detected() {
        let g = graph(&[(1, Some(2)), (2, Some(3)), (3, Some(2))]);
        let err = resolve_leader(ClientId(1), g.len(), |id| g.get(&id).copied()).unwrap_err();
        assert!(matches!(err, ConfigurationError::WeatherCycle(_)));
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let g = graph(&[(4, Some(4))]);
        let err = resolve_leader(ClientId(4), g.len(), |id| g.get(&id).copied()).unwrap_err();
        assert!(matches!(err, ConfigurationError::WeatherCycle(_)));
    }

    #[test]
    fn test_dangling_reference() {
        let g = graph(&[(1, Some(9))]);
        let err = resolve_leader(ClientId(1), g.len(), |id| g.get(&id).copied()).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::DanglingWeatherRef {
                from: ClientId(1),
                to: ClientId(9)
            }
        );
    }

    #[test]
    fn test_every_acyclic_graph_terminates() {
        // each node points at a strictly smaller id, or is a leader
        for n in 1..=12i64 {
            let edges: Vec<_> = (1..=n)
                .map(|id| (id, if id % 3 == 1 { None } else { Some(id - 1) }))
                .collect();
            let g = graph(&edges);
            let plan = plan_forecasts(&g);
            assert!(plan.unresolved.is_empty());
            let covered: usize = plan.leaders.values().map(|f| f.len() + 1).sum();
            assert_eq!(covered, n as usize);
        }
    }

    fn at(latitude: f64, longitude: f64) -> Position {
        Position {
            latitude,
            longitude,
            altitude: 0.0,
        }
    }

    #[test]
    fn test_distance_km() {
        let paris = at(48.85, 2.35);
        assert_eq!(distance_km(&paris, &paris), 0.0);
        let lyon = at(45.76, 4.84);
        assert!((distance_km(&paris, &lyon) - 392.0).abs() < 5.0);
    }

    #[test]
    fn test_nearby_leaders_share_a_group() {
        // 2 is ~17 km from 1, 4 is in Lyon
        let g = graph(&[(1, None), (2, None), (3, Some(2)), (4, None)]);
        let positions: BTreeMap<_, _> = [
            (ClientId(1), at(48.85, 2.35)),
            (ClientId(2), at(48.80, 2.13)),
            (ClientId(4), at(45.76, 4.84)),
        ]
        .into_iter()
        .collect();

        let plan = group_nearby(plan_forecasts(&g), &positions, 20.0);
        assert_eq!(plan.leaders.len(), 2);
        assert_eq!(plan.leaders[&ClientId(1)], vec![ClientId(2), ClientId(3)]);
        assert!(plan.leaders[&ClientId(4)].is_empty());

        let plan = group_nearby(plan_forecasts(&g), &positions, 15.0);
        assert_eq!(plan.leaders.len(), 3);

        let plan = group_nearby(plan_forecasts(&g), &positions, 0.0);
        assert_eq!(plan, plan_forecasts(&g));
    }

    #[test]
    fn test_plan_groups_followers() {
        let g = graph(&[(1, None), (2, Some(1)), (3, Some(1)), (4, Some(5)), (5, Some(4))]);
        let plan = plan_forecasts(&g);
        assert_eq!(plan.leaders.len(), 1);
        assert_eq!(plan.leaders[&ClientId(1)], vec![ClientId(2), ClientId(3)]);
        assert_eq!(plan.unresolved.len(), 2);
    }
}
