//! Placement resolution: which agents run a check.

use crate::check::Placement;
use crate::db::{Agent, Region};

/// Enabled agents a check with `placement` runs on, ordered by id.
///
/// Region placement expands to every enabled agent of an enabled region;
/// country placement to every such agent of the country's enabled regions.
pub fn placement_agents(placement: &Placement, agents: &[Agent], regions: &[Region]) -> Vec<i64> {
    let region_enabled = |id: Option<i64>| {
        id.and_then(|id| regions.iter().find(|r| r.id == id))
            .filter(|r| r.enabled)
    };

    let mut ids: Vec<i64> = agents
        .iter()
        .filter(|a| a.enabled)
        .filter(|a| match *placement {
            Placement::Agent(id) => a.id == id,
            Placement::Region(id) => region_enabled(a.region_id).is_some_and(|r| r.id == id),
            Placement::Country(id) => {
                region_enabled(a.region_id).is_some_and(|r| r.country_id == Some(id))
            }
            Placement::All => true,
        })
        .map(|a| a.id)
        .collect();
    ids.sort_unstable();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: i64, region_id: Option<i64>, enabled: bool) -> Agent {
        Agent {
            id,
            name: format!("agent-{}", id),
            description: String::new(),
            server: "127.0.0.1".to_string(),
            port: 5101,
            enabled,
            shared: false,
            region_id,
        }
    }

    fn region(id: i64, country_id: Option<i64>, enabled: bool) -> Region {
        Region {
            id,
            name: format!("region-{}", id),
            description: String::new(),
            enabled,
            shared: false,
            country_id,
        }
    }

    #[test]
    fn test_placement_sets() {
        let agents = vec![
            agent(1, Some(10), true),
            agent(2, Some(10), true),
            agent(3, Some(20), true),
            agent(4, Some(10), false),
            agent(5, None, true),
        ];
        let regions = vec![region(10, Some(100), true), region(20, Some(100), false)];

        assert_eq!(placement_agents(&Placement::Agent(3), &agents, &regions), vec![3]);
        assert_eq!(placement_agents(&Placement::Agent(4), &agents, &regions), Vec::<i64>::new());
        assert_eq!(placement_agents(&Placement::Region(10), &agents, &regions), vec![1, 2]);
        // Region 20 is disabled, so country 100 only reaches region 10.
        assert_eq!(placement_agents(&Placement::Country(100), &agents, &regions), vec![1, 2]);
        assert_eq!(placement_agents(&Placement::All, &agents, &regions), vec![1, 2, 3, 5]);
    }
}
