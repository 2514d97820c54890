use std::collections::HashMap;

use rand::{seq::SliceRandom, Rng};

use crate::{
    core::participant::Participant,
    error::{Error, Result},
};

/// A single `assigned_to` write, applied in order.
/// `target: None` clears the edge and resets `has_picked`.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct EdgeWrite {
    pub giver: i64,
    pub target: Option<i64>,
}

/// The outcome of planning a pick, before anything is written.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct PickPlan {
    pub recipient: i64,
    pub writes: Vec<EdgeWrite>,
    /// The giver whose edge was retargeted to resolve a last-pick deadlock
    pub rerouted: Option<i64>,
}

/// The edges to splice before a participant's row is deleted.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct RemovalPlan {
    pub giver: Option<i64>,
    pub target: Option<i64>,
    pub writes: Vec<EdgeWrite>,
}

/// A path of edges that is not yet closed into a cycle.
/// `start` has no giver, `end` has not picked. A lone participant has `start == end`.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
struct Chain {
    start: i64,
    end: i64,
}

/// Snapshot of a session's gives-to edges, indexed in both directions.
///
/// Built from the participant rows inside a transaction and thrown away
/// when the transaction ends.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct EdgeGraph {
    /// Participant IDs in join order
    members: Vec<i64>,
    gives_to: HashMap<i64, i64>,
    receives_from: HashMap<i64, i64>,
}

impl EdgeGraph {
    pub fn from_participants(participants: &[Participant]) -> Result<Self> {
        let mut graph = EdgeGraph {
            members: participants.iter().map(|p| p.id).collect(),
            ..Default::default()
        };

        for participant in participants {
            if participant.has_picked != participant.assigned_to.is_some() {
                return Err(Error::integrity(format!(
                    "participant {} has has_picked = {} but assigned_to = {:?}",
                    participant.id, participant.has_picked, participant.assigned_to
                )));
            }

            if let Some(target) = participant.assigned_to {
                if target == participant.id {
                    return Err(Error::integrity(format!(
                        "participant {} is stored as giving to themselves",
                        participant.id
                    )));
                }
                graph.link(participant.id, target)?;
            }
        }

        Ok(graph)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.members.contains(&id)
    }

    pub fn target_of(&self, id: i64) -> Option<i64> {
        self.gives_to.get(&id).copied()
    }

    pub fn giver_of(&self, id: i64) -> Option<i64> {
        self.receives_from.get(&id).copied()
    }

    pub fn has_picked(&self, id: i64) -> bool {
        self.gives_to.contains_key(&id)
    }

    /// Participants nobody gives to yet, in join order.
    pub fn untargeted(&self) -> impl Iterator<Item = i64> + '_ {
        self.members
            .iter()
            .copied()
            .filter(|id| !self.receives_from.contains_key(id))
    }

    /// Every participant that may be drawn by `picker`, before deadlock filtering.
    pub fn candidate_pool(&self, picker: i64) -> Vec<i64> {
        self.untargeted().filter(|&id| id != picker).collect()
    }

    /// True once everyone gives and receives exactly once.
    pub fn is_complete(&self) -> bool {
        self.members.len() >= 2
            && self
                .members
                .iter()
                .all(|id| self.gives_to.contains_key(id) && self.receives_from.contains_key(id))
    }

    /// Insert `giver -> target`, rejecting anything that breaks the partial derangement.
    fn link(&mut self, giver: i64, target: i64) -> Result<()> {
        if giver == target {
            log::error!("Refusing to assign participant {} to themselves", giver);
            return Err(Error::CannotSelfAssign);
        }

        if !self.contains(giver) || !self.contains(target) {
            return Err(Error::integrity(format!(
                "edge {} -> {} leaves the session",
                giver, target
            )));
        }

        if let Some(existing) = self.giver_of(target) {
            if existing != giver {
                return Err(Error::integrity(format!(
                    "participant {} would receive from both {} and {}",
                    target, existing, giver
                )));
            }
        }

        self.unlink(giver);
        self.gives_to.insert(giver, target);
        self.receives_from.insert(target, giver);
        Ok(())
    }

    fn unlink(&mut self, giver: i64) {
        if let Some(target) = self.gives_to.remove(&giver) {
            self.receives_from.remove(&target);
        }
    }

    /// Walk givers back from an unpicked participant to the start of its chain.
    fn chain_start(&self, end: i64) -> i64 {
        let mut current = end;
        while let Some(giver) = self.giver_of(current) {
            if giver == end {
                break;
            }
            current = giver;
        }
        current
    }

    fn open_chains(&self) -> Vec<Chain> {
        self.untargeted()
            .map(|start| {
                let mut end = start;
                while let Some(next) = self.target_of(end) {
                    end = next;
                }
                Chain { start, end }
            })
            .collect()
    }

    /// Whether drawing `candidate` would leave a single lone participant as the
    /// only open chain, which nobody could then complete without a self-assignment.
    fn strands_lone_participant(&self, own_start: i64, candidate: i64, chains: &[Chain]) -> bool {
        candidate == own_start
            && chains.len() == 2
            && chains
                .iter()
                .any(|c| c.start != own_start && c.start == c.end)
    }

    /// Choose a recipient for `picker`.
    ///
    /// Candidates that would strand a lone participant are dropped first. If no
    /// candidate is left, an existing edge `G -> R` is swapped: the picker takes
    /// `R` and `G` is redirected to the start of the picker's own chain.
    pub fn plan_pick<R: Rng + ?Sized>(&self, picker: i64, rng: &mut R) -> Result<PickPlan> {
        if !self.contains(picker) {
            return Err(Error::ParticipantNotFound(format!("#{}", picker)));
        }
        if self.has_picked(picker) {
            return Err(Error::AlreadyPicked(format!("#{}", picker)));
        }

        let own_start = self.chain_start(picker);
        let chains = self.open_chains();

        let pool: Vec<i64> = self
            .candidate_pool(picker)
            .into_iter()
            .filter(|&c| !self.strands_lone_participant(own_start, c, &chains))
            .collect();

        if let Some(&recipient) = pool.choose(rng) {
            return Ok(PickPlan {
                recipient,
                writes: vec![EdgeWrite {
                    giver: picker,
                    target: Some(recipient),
                }],
                rerouted: None,
            });
        }

        let swappable: Vec<(i64, i64)> = self
            .members
            .iter()
            .filter_map(|&g| self.target_of(g).map(|r| (g, r)))
            .filter(|&(g, r)| g != picker && r != picker && g != own_start)
            .collect();

        let &(giver, recipient) = swappable
            .choose(rng)
            .ok_or(Error::NoParticipantsAvailable)?;

        log::debug!(
            "Last pick for {} is deadlocked, swapping edge {} -> {}",
            picker,
            giver,
            recipient
        );

        Ok(PickPlan {
            recipient,
            // The giver moves first so the recipient is free when the picker takes it.
            writes: vec![
                EdgeWrite {
                    giver,
                    target: Some(own_start),
                },
                EdgeWrite {
                    giver: picker,
                    target: Some(recipient),
                },
            ],
            rerouted: Some(giver),
        })
    }

    /// Plan the splice that keeps the chain through `removed` intact.
    pub fn plan_removal(&self, removed: i64) -> Result<RemovalPlan> {
        if !self.contains(removed) {
            return Err(Error::ParticipantNotFound(format!("#{}", removed)));
        }

        let giver = self.giver_of(removed);
        let target = self.target_of(removed);
        let mut writes = Vec::new();

        // Free the target first, the store allows a single giver per participant.
        if target.is_some() {
            writes.push(EdgeWrite {
                giver: removed,
                target: None,
            });
        }

        match (giver, target) {
            (Some(giver), Some(target)) if giver != target => writes.push(EdgeWrite {
                giver,
                target: Some(target),
            }),
            // Either the removed participant never picked, or the two formed a pair.
            (Some(giver), _) => writes.push(EdgeWrite {
                giver,
                target: None,
            }),
            (None, _) => {}
        }

        Ok(RemovalPlan {
            giver,
            target,
            writes,
        })
    }

    /// Apply planned writes to a copy of the graph, checking every invariant.
    /// `removed` is dropped from the copy afterwards and must not be referenced any more.
    pub fn apply(&self, writes: &[EdgeWrite], removed: Option<i64>) -> Result<EdgeGraph> {
        let mut next = self.clone();

        for write in writes {
            match write.target {
                Some(target) => next.link(write.giver, target)?,
                None => next.unlink(write.giver),
            }
        }

        if let Some(removed) = removed {
            next.unlink(removed);
            if let Some(giver) = next.giver_of(removed) {
                return Err(Error::integrity(format!(
                    "participant {} still gives to removed participant {}",
                    giver, removed
                )));
            }
            next.members.retain(|&id| id != removed);
        }

        Ok(next)
    }
}
