use crate::hypervisor::Hypervisor;
use crate::inventory::Inventory;
use crate::migration::Migration;
use crate::server::Server;
use anyhow::Result;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Plans the migrations that move every hypervisor's free-capacity ratio
/// towards the workload's most common ratio. All work happens against the
/// inventory's live server lists; the snapshot stack is the undo mechanism.
pub struct Planner<'a> {
    inventory: &'a mut Inventory,
}

impl<'a> Planner<'a> {
    pub fn new(inventory: &'a mut Inventory) -> Self {
        Self { inventory }
    }

    fn host_mut(&mut self, id: u64) -> &mut Hypervisor {
        self.inventory
            .hypervisor_mut(id)
            .expect("planner references a known hypervisor")
    }

    /// Pour both hypervisors' servers into one pool, greedily refill the
    /// subject with whatever keeps its score closest to zero and hand the
    /// remainder to the donor. Accepted only when the combined score
    /// strictly improves; on any failure both hosts are restored and None
    /// is returned.
    ///
    /// The migration list produced here ignores intermediate capacity, so
    /// planning may still have to shuffle servers through a third host.
    fn mix_hypervisors(&mut self, subject_id: u64, improvement_id: u64) -> Option<Vec<Migration>> {
        let subject_ref = self
            .inventory
            .host_ref(subject_id)
            .expect("mixing a known hypervisor");
        let improvement_ref = self
            .inventory
            .host_ref(improvement_id)
            .expect("mixing a known hypervisor");
        info!("Mixing {} and {}", subject_ref.hostname, improvement_ref.hostname);

        let (subject, improvement) = self
            .inventory
            .hypervisor_pair_mut(subject_id, improvement_id)
            .expect("mixing known hypervisors");

        let score_before = subject.score().abs() + improvement.score().abs();
        let subject_original = subject.pop_all();
        let improvement_original = improvement.pop_all();
        let mut pool: Vec<Arc<Server>> = subject_original
            .iter()
            .chain(improvement_original.iter())
            .cloned()
            .collect();

        while !pool.is_empty() {
            let mut best: Option<(usize, f64)> = None;
            for (index, vm) in pool.iter().enumerate() {
                let score = subject.score_with(vm).abs();
                if best.map_or(true, |(_, b)| score < b) {
                    best = Some((index, score));
                }
            }
            let (best_index, _) = best.expect("pool is non-empty");
            if !subject.add_server(pool[best_index].clone(), false) {
                break;
            }
            pool.remove(best_index);
        }

        for vm in &pool {
            if !improvement.add_server(vm.clone(), false) {
                warn!("Could not fit VMs in hypervisors!");
                subject.set_servers(subject_original);
                improvement.set_servers(improvement_original);
                return None;
            }
        }

        let score_after = subject.score().abs() + improvement.score().abs();
        info!("Score from {} to {}", score_before, score_after);
        if score_after >= score_before {
            subject.set_servers(subject_original);
            improvement.set_servers(improvement_original);
            return None;
        }

        let mut migrations: Vec<Migration> = subject
            .servers()
            .iter()
            .filter(|s| !subject_original.contains(*s))
            .map(|s| Migration::new(s.clone(), improvement_ref.clone(), subject_ref.clone()))
            .collect();
        migrations.extend(
            improvement
                .servers()
                .iter()
                .filter(|s| !improvement_original.contains(*s))
                .map(|s| Migration::new(s.clone(), subject_ref.clone(), improvement_ref.clone())),
        );
        Some(migrations)
    }

    /// Find one migration that temporarily frees capacity on `target`:
    /// candidate hosts with the largest free headroom first, largest
    /// victims first. The move is committed before it is returned.
    fn increase_buffer(
        &mut self,
        target_id: u64,
        skip_host_ids: &[u64],
        skip_server_ids: &[String],
    ) -> Option<Migration> {
        let mut candidates: Vec<(u64, i64)> = self
            .inventory
            .enabled_hypervisors()
            .filter(|h| h.id != target_id && !skip_host_ids.contains(&h.id))
            .map(|h| (h.id, h.available_vcpus() * h.available_ram()))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let target_ref = self
            .inventory
            .host_ref(target_id)
            .expect("buffering a known hypervisor");
        let mut victims: Vec<Arc<Server>> = self
            .inventory
            .hypervisor(target_id)
            .expect("buffering a known hypervisor")
            .servers()
            .iter()
            .filter(|s| !skip_server_ids.contains(&s.id))
            .cloned()
            .collect();
        victims.sort_by(|a, b| {
            b.length()
                .partial_cmp(&a.length())
                .expect("server length is never NaN")
        });

        for (candidate_id, _) in candidates {
            for victim in &victims {
                if self.host_mut(candidate_id).add_server(victim.clone(), false) {
                    assert!(self.host_mut(target_id).remove_server(victim));
                    let candidate_ref = self
                        .inventory
                        .host_ref(candidate_id)
                        .expect("buffering towards a known hypervisor");
                    return Some(Migration::new(victim.clone(), target_ref, candidate_ref));
                }
            }
        }

        warn!("Could not find available resources to migrate!");
        None
    }

    /// Execute one migration against the live state, inserting buffer moves
    /// until the destination accepts the server. Returns the migrations
    /// performed and the reverses of any buffer moves, or None with the
    /// server back on its source when no buffer can be found.
    fn try_migration(&mut self, migration: &Migration) -> Option<(Vec<Migration>, Vec<Migration>)> {
        let server = migration.server.clone();
        assert!(self.host_mut(migration.source.id).remove_server(&server));

        let mut migrations = Vec::new();
        let mut post_migrations = Vec::new();
        while !self
            .host_mut(migration.destination.id)
            .add_server(server.clone(), false)
        {
            info!("Unable to migrate server {}, adding buffer.", server.name);
            match self.increase_buffer(
                migration.destination.id,
                &[migration.source.id],
                &[server.id.clone()],
            ) {
                Some(buffer) => {
                    post_migrations.push(buffer.reverse());
                    migrations.push(buffer);
                }
                None => {
                    self.host_mut(migration.source.id).add_server(server, true);
                    return None;
                }
            }
        }
        migrations.push(migration.clone());
        Some((migrations, post_migrations))
    }

    /// Turn the logical moves of a mix into an executable sequence. The
    /// list is walked by index while its tail grows with the reverses of
    /// buffer moves; a reverse whose server is still pending a migration of
    /// its own is fused into that migration instead of bouncing back.
    /// Returns the empty list, with the inventory restored to the latest
    /// snapshot, when a step cannot be buffered.
    fn plan_migrations(&mut self, mut needed: Vec<Migration>) -> Result<Vec<Migration>> {
        let mut migrations = Vec::new();
        let mut skip_servers: HashSet<String> = HashSet::new();

        let mut index = 0;
        while index < needed.len() {
            let migration = needed[index].clone();
            index += 1;
            if skip_servers.remove(&migration.server.id) {
                continue;
            }
            let Some((mut performed, post_migrations)) = self.try_migration(&migration) else {
                warn!("Could not get enough free resources.");
                self.inventory.use_snapshot(-1, false)?;
                return Ok(Vec::new());
            };
            migrations.append(&mut performed);
            for mut post in post_migrations {
                let pending: Vec<usize> = (index..needed.len())
                    .filter(|&i| needed[i].server == post.server)
                    .collect();
                if let Some(&first) = pending.first() {
                    assert_eq!(
                        pending.len(),
                        1,
                        "server {} is pending more than one migration",
                        post.server.id
                    );
                    skip_servers.insert(post.server.id.clone());
                    post.destination = needed[first].destination.clone();
                }
                needed.push(post);
            }
        }

        Ok(migrations)
    }

    /// Replay the full migration list against the original snapshot. Any
    /// failure here is a planner defect, not an input problem.
    fn validate_migrations(&mut self, migrations: &[Migration]) -> Result<()> {
        self.inventory.use_snapshot(0, true)?;

        let ids = self.inventory.all_server_ids();
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len(), "duplicate server ids in inventory");
        let server_count = ids.len();

        for migration in migrations {
            assert!(self
                .inventory
                .hypervisor(migration.source.id)
                .expect("validating a known hypervisor")
                .enabled());
            assert!(self
                .inventory
                .hypervisor(migration.destination.id)
                .expect("validating a known hypervisor")
                .enabled());
            assert!(self
                .host_mut(migration.source.id)
                .remove_server(&migration.server));
            assert!(self
                .host_mut(migration.destination.id)
                .add_server(migration.server.clone(), false));
        }

        let ids = self.inventory.all_server_ids();
        assert_eq!(server_count, ids.len(), "migration list loses servers");
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len(), "duplicate server ids after replay");

        info!("Validated migration list");
        Ok(())
    }

    /// Repeatedly improve the worst-scoring hypervisor against the most
    /// divergent donor of the opposite sign, until no pair yields progress
    /// or the iteration count runs out.
    pub fn optimize(&mut self, iterations: u32) -> Result<Vec<Migration>> {
        let mut migrations: Vec<Migration> = Vec::new();
        let mut remaining = iterations;

        while remaining > 0 {
            let mut subjects: Vec<(u64, f64)> = self
                .inventory
                .enabled_hypervisors()
                .map(|h| (h.id, h.score().abs()))
                .collect();
            subjects.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("scores are never NaN"));

            let mut progressed = false;
            for (subject_id, _) in subjects {
                let score = self
                    .inventory
                    .hypervisor(subject_id)
                    .expect("subject is a known hypervisor")
                    .score();
                let improvement = if score < 0.0 {
                    self.inventory.right_divergent()
                } else {
                    self.inventory.left_divergent()
                };
                let Some(improvement_id) = improvement else {
                    continue;
                };

                let needed = self.mix_hypervisors(subject_id, improvement_id);
                self.inventory.use_snapshot(-1, false)?;
                let Some(needed) = needed else {
                    continue;
                };

                let planned = self.plan_migrations(needed)?;
                migrations.extend(planned);
                fuse_migrations(&mut migrations);
                self.inventory.snapshot(false)?;
                self.validate_migrations(&migrations)?;
                remaining -= 1;
                progressed = true;
                break;
            }

            if !progressed {
                return Ok(migrations);
            }
        }

        Ok(migrations)
    }
}

/// Collapse successive migrations of the same server into one, repeating
/// until a full scan leaves the list unchanged
fn fuse_migrations(migrations: &mut Vec<Migration>) {
    let mut fused = true;
    while fused {
        fused = false;
        for index in 0..migrations.len().saturating_sub(1) {
            if migrations[index].server == migrations[index + 1].server {
                let merged = Migration::new(
                    migrations[index].server.clone(),
                    migrations[index].source.clone(),
                    migrations[index + 1].destination.clone(),
                );
                migrations.splice(index..index + 2, [merged]);
                fused = true;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::HostRef;
    use crate::nova::HypervisorDetail;
    use crate::server::{Flavor, Server};
    use crate::settings::Overcommit;

    const COMMON_RATIO: i64 = 2048;

    fn server(id: &str, ram_mb: u64, vcpus: u32) -> Arc<Server> {
        Arc::new(Server::new(
            id.to_string(),
            id.to_string(),
            "ACTIVE".to_string(),
            None,
            &Flavor {
                id: "f".to_string(),
                ram_mb,
                vcpus,
            },
        ))
    }

    /// Build a hypervisor whose reported usage counters agree with the
    /// servers placed on it, so replay validation can re-check snapshot 0
    fn host(
        id: u64,
        hostname: &str,
        enabled: bool,
        vcpus: u32,
        memory_mb: u64,
        overhead: i64,
        servers: &[Arc<Server>],
    ) -> Hypervisor {
        let vcpus_used: i64 = servers.iter().map(|s| s.vcpus() as i64).sum();
        let memory_mb_used: i64 =
            servers.iter().map(|s| s.ram() as i64).sum::<i64>() + overhead;
        let mut hypervisor = Hypervisor::new(
            &HypervisorDetail {
                id,
                hypervisor_hostname: hostname.to_string(),
                status: if enabled { "enabled" } else { "disabled" }.to_string(),
                vcpus,
                memory_mb,
                vcpus_used,
                memory_mb_used,
            },
            COMMON_RATIO,
            Overcommit {
                ram_overcommit: 1.0,
                cpu_overcommit: 1.0,
                memory_overhead_mb: overhead,
            },
        );
        for s in servers {
            hypervisor.add_server(s.clone(), true);
        }
        hypervisor
    }

    fn host_ref(id: u64, hostname: &str) -> HostRef {
        HostRef {
            id,
            hostname: hostname.to_string(),
        }
    }

    fn sorted_ids(inventory: &Inventory) -> Vec<String> {
        let mut ids = inventory.all_server_ids();
        ids.sort();
        ids
    }

    fn total_score(inventory: &Inventory) -> f64 {
        inventory
            .enabled_hypervisors()
            .map(|h| h.score().abs())
            .sum()
    }

    #[test]
    fn empty_fleet_plans_nothing() {
        let mut inventory = Inventory::from_parts(vec![], 0);
        let plan = Planner::new(&mut inventory).optimize(3).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn single_hypervisor_plans_nothing() {
        let hv = host(1, "hv1", true, 32, 131072, 0, &[server("a", 16384, 8)]);
        let mut inventory = Inventory::from_parts(vec![hv], COMMON_RATIO);
        let plan = Planner::new(&mut inventory).optimize(3).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn balanced_fleet_is_left_alone() {
        // each host's free ratio is exactly the common ratio, so every
        // score is zero and no donor qualifies
        let a = host(1, "hv1", true, 32, 98304, 32768, &[server("a", 4096, 2)]);
        let b = host(2, "hv2", true, 32, 98304, 32768, &[server("b", 4096, 2)]);
        let mut inventory = Inventory::from_parts(vec![a, b], COMMON_RATIO);
        let before = sorted_ids(&inventory);

        let plan = Planner::new(&mut inventory).optimize(3).unwrap();
        assert!(plan.is_empty());
        assert_eq!(sorted_ids(&inventory), before);
        assert_eq!(inventory.hypervisor(1).unwrap().servers().len(), 1);
        assert_eq!(inventory.hypervisor(2).unwrap().servers().len(), 1);
    }

    #[test]
    fn lopsided_fleet_gets_rebalanced() {
        // hv1 hosts one vCPU-heavy VM and has RAM-rich free capacity, hv2
        // hosts the RAM-heavy VMs and has vCPU-rich free capacity
        let a = host(1, "hv1", true, 32, 131072, 0, &[server("v1", 4096, 16)]);
        let b = host(
            2,
            "hv2",
            true,
            32,
            131072,
            0,
            &[server("r1", 65536, 2), server("r2", 32768, 2)],
        );
        let mut inventory = Inventory::from_parts(vec![a, b], COMMON_RATIO);
        let ids_before = sorted_ids(&inventory);
        let score_before = total_score(&inventory);
        assert!(inventory.hypervisor(1).unwrap().score() < 0.0);
        assert!(inventory.hypervisor(2).unwrap().score() > 0.0);

        let plan = Planner::new(&mut inventory).optimize(3).unwrap();

        assert!(!plan.is_empty());
        // the RAM-heavy servers move towards the host with too much free RAM
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].server.id, "r1");
        assert_eq!(plan[1].server.id, "r2");
        for migration in &plan {
            assert_eq!(migration.source, host_ref(2, "hv2"));
            assert_eq!(migration.destination, host_ref(1, "hv1"));
            assert!(inventory.hypervisor(migration.source.id).unwrap().enabled());
            assert!(inventory
                .hypervisor(migration.destination.id)
                .unwrap()
                .enabled());
        }
        // conservation and strict improvement of the combined score
        assert_eq!(sorted_ids(&inventory), ids_before);
        assert!(total_score(&inventory) < score_before);
    }

    #[test]
    fn plan_inserts_buffer_and_its_reverse() {
        // hv2 is too full to take v1 before r2 has left, so r1 is parked on
        // hv3 and brought back after the primary moves
        let a = host(1, "hv1", true, 16, 131072, 32768, &[server("v1", 32768, 8)]);
        let b = host(
            2,
            "hv2",
            true,
            16,
            131072,
            32768,
            &[server("r1", 65536, 2), server("r2", 16384, 2)],
        );
        let c = host(3, "hv3", true, 16, 131072, 32768, &[]);
        let mut inventory = Inventory::from_parts(vec![a, b, c], COMMON_RATIO);
        let ids_before = sorted_ids(&inventory);

        let needed = vec![
            Migration::new(server("v1", 32768, 8), host_ref(1, "hv1"), host_ref(2, "hv2")),
            Migration::new(server("r2", 16384, 2), host_ref(2, "hv2"), host_ref(1, "hv1")),
        ];
        let plan = {
            let mut planner = Planner::new(&mut inventory);
            let plan = planner.plan_migrations(needed).unwrap();
            planner.validate_migrations(&plan).unwrap();
            plan
        };

        assert_eq!(plan.len(), 4);
        // the buffer move comes first, its reverse after the primaries
        assert_eq!(plan[0].server.id, "r1");
        assert_eq!(plan[0].destination, host_ref(3, "hv3"));
        assert_eq!(plan[1].server.id, "v1");
        assert_eq!(plan[2].server.id, "r2");
        assert_eq!(plan[3].server.id, "r1");
        assert_eq!(plan[3].source, host_ref(3, "hv3"));
        assert_eq!(plan[3].destination, host_ref(2, "hv2"));
        assert_eq!(plan[3], plan[0].reverse());

        assert_eq!(sorted_ids(&inventory), ids_before);
        assert!(inventory.hypervisor(3).unwrap().servers().is_empty());
    }

    #[test]
    fn buffered_server_with_pending_move_goes_straight_to_target() {
        // r1 must leave hv2 to admit v1 and is itself due on hv3; instead
        // of bouncing back to hv2 its reverse is rewritten to hv3
        let a = host(1, "hv1", true, 16, 131072, 32768, &[server("v1", 32768, 8)]);
        let b = host(
            2,
            "hv2",
            true,
            16,
            131072,
            32768,
            &[server("r1", 65536, 2), server("r2", 16384, 2)],
        );
        let c = host(3, "hv3", true, 16, 131072, 32768, &[]);
        let d = host(4, "hv4", true, 32, 262144, 32768, &[]);
        let mut inventory = Inventory::from_parts(vec![a, b, c, d], COMMON_RATIO);

        let needed = vec![
            Migration::new(server("v1", 32768, 8), host_ref(1, "hv1"), host_ref(2, "hv2")),
            Migration::new(server("r1", 65536, 2), host_ref(2, "hv2"), host_ref(3, "hv3")),
        ];
        let plan = Planner::new(&mut inventory).plan_migrations(needed).unwrap();

        // the buffer host with the largest headroom (hv4) is used, and r1
        // moves on to hv3 without revisiting hv2
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].server.id, "r1");
        assert_eq!(plan[0].destination, host_ref(4, "hv4"));
        assert_eq!(plan[1].server.id, "v1");
        assert_eq!(plan[2].server.id, "r1");
        assert_eq!(plan[2].source, host_ref(4, "hv4"));
        assert_eq!(plan[2].destination, host_ref(3, "hv3"));

        assert!(inventory.hypervisor(4).unwrap().servers().is_empty());
        assert_eq!(inventory.hypervisor(3).unwrap().servers()[0].id, "r1");
    }

    #[test]
    fn infeasible_plan_restores_the_inventory() {
        // hv1 is completely full and hv2 cannot take its server, with no
        // third host to buffer through
        let a = host(1, "hv1", true, 16, 131072, 32768, &[server("r1", 98304, 2)]);
        let b = host(2, "hv2", true, 16, 49152, 32768, &[]);
        let mut inventory = Inventory::from_parts(vec![a, b], COMMON_RATIO);

        let needed = vec![Migration::new(
            server("r1", 98304, 2),
            host_ref(1, "hv1"),
            host_ref(2, "hv2"),
        )];
        let plan = Planner::new(&mut inventory).plan_migrations(needed).unwrap();

        assert!(plan.is_empty());
        assert_eq!(inventory.hypervisor(1).unwrap().servers()[0].id, "r1");
        assert!(inventory.hypervisor(2).unwrap().servers().is_empty());
    }

    #[test]
    fn disabled_hosts_never_donate_or_receive() {
        // the only host with the opposite score sign is disabled, so the
        // subject finds no donor and the plan stays empty
        let b = host(2, "hv2", true, 32, 131072, 32768, &[server("r1", 65536, 2)]);
        let d = host(4, "hv4", false, 32, 131072, 32768, &[]);
        let mut inventory = Inventory::from_parts(vec![b, d], COMMON_RATIO);
        assert!(inventory.hypervisor(2).unwrap().score() > 0.0);

        let plan = Planner::new(&mut inventory).optimize(3).unwrap();
        assert!(plan.is_empty());
        assert!(inventory.hypervisor(4).unwrap().servers().is_empty());
        assert_eq!(inventory.hypervisor(2).unwrap().servers().len(), 1);
    }

    #[test]
    fn fusion_merges_adjacent_moves_of_one_server() {
        let s = server("s", 2048, 1);
        let other = server("t", 2048, 1);
        let mut migrations = vec![
            Migration::new(s.clone(), host_ref(1, "hv1"), host_ref(2, "hv2")),
            Migration::new(s.clone(), host_ref(2, "hv2"), host_ref(3, "hv3")),
            Migration::new(other.clone(), host_ref(1, "hv1"), host_ref(2, "hv2")),
        ];
        fuse_migrations(&mut migrations);
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].source, host_ref(1, "hv1"));
        assert_eq!(migrations[0].destination, host_ref(3, "hv3"));
        assert_eq!(migrations[1].server.id, "t");
    }

    #[test]
    fn fusion_runs_to_a_fixed_point() {
        let s = server("s", 2048, 1);
        let mut migrations = vec![
            Migration::new(s.clone(), host_ref(1, "hv1"), host_ref(2, "hv2")),
            Migration::new(s.clone(), host_ref(2, "hv2"), host_ref(3, "hv3")),
            Migration::new(s.clone(), host_ref(3, "hv3"), host_ref(4, "hv4")),
        ];
        fuse_migrations(&mut migrations);
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].source, host_ref(1, "hv1"));
        assert_eq!(migrations[0].destination, host_ref(4, "hv4"));
    }

    #[test]
    fn fusion_leaves_separated_moves_alone() {
        let s = server("s", 2048, 1);
        let other = server("t", 2048, 1);
        let mut migrations = vec![
            Migration::new(s.clone(), host_ref(1, "hv1"), host_ref(2, "hv2")),
            Migration::new(other.clone(), host_ref(3, "hv3"), host_ref(1, "hv1")),
            Migration::new(s.clone(), host_ref(2, "hv2"), host_ref(3, "hv3")),
        ];
        fuse_migrations(&mut migrations);
        assert_eq!(migrations.len(), 3);
    }
}
