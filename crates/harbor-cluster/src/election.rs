//! Controller election state machine.
//!
//! Every controller candidate runs the same round-based vote:
//!
//! 1. In round 1 each candidate proposes itself.
//! 2. Each candidate broadcasts its vote to all candidates and collects
//!    the votes of the round.
//! 3. The round is decided when some node has a quorum of votes *and* a
//!    vote from every candidate has arrived.
//! 4. If every vote arrived without a decision, the next round proposes
//!    the largest node id proposed in the failed round.
//!
//! Because every candidate sees the same set of votes for a round, all of
//! them reach the same decision. The flip side is liveness: one silent
//! candidate stalls the round for everybody, and nothing here times out.
//!
//! This type is pure bookkeeping; sending and receiving votes is done by
//! the node driving it.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::NodeId;

/// One candidate's vote in one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vote {
    pub voter: NodeId,
    /// The node this voter proposes as controller.
    pub controller: NodeId,
    pub round: u32,
}

/// What recording a vote did to the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The current round is still collecting votes.
    Pending,
    /// The election is over.
    Decided(NodeId),
    /// The round failed; the election moved on to `round` proposing
    /// `proposal`. The caller must broadcast the new vote.
    NextRound { round: u32, proposal: NodeId },
}

/// Round-based controller election among a fixed set of candidates.
#[derive(Debug)]
pub struct Election {
    local_id: NodeId,
    candidates: BTreeSet<NodeId>,
    round: u32,
    proposal: NodeId,
    /// round → voter → proposed controller. Holds the current round and
    /// any early votes for later rounds.
    ballots: BTreeMap<u32, BTreeMap<NodeId, NodeId>>,
    winner: Option<NodeId>,
}

impl Election {
    /// Starts an election in round 1 with the local node proposing itself.
    ///
    /// `candidates` may or may not include `local_id`; it is always added.
    pub fn new(local_id: NodeId, candidates: impl IntoIterator<Item = NodeId>) -> Self {
        let mut candidates: BTreeSet<NodeId> = candidates.into_iter().collect();
        candidates.insert(local_id);
        Self {
            local_id,
            candidates,
            round: 1,
            proposal: local_id,
            ballots: BTreeMap::new(),
            winner: None,
        }
    }

    /// Minimum votes required to decide a round: `candidates / 2 + 1`.
    pub fn quorum(candidate_count: usize) -> usize {
        candidate_count / 2 + 1
    }

    /// The round currently being collected.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Number of candidates taking part.
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// The candidates taking part, including the local node.
    pub fn candidates(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.candidates.iter().copied()
    }

    /// The elected controller, once decided.
    pub fn winner(&self) -> Option<NodeId> {
        self.winner
    }

    /// The local node's vote for the current round.
    pub fn current_vote(&self) -> Vote {
        Vote {
            voter: self.local_id,
            controller: self.proposal,
            round: self.round,
        }
    }

    /// Records a vote and re-evaluates the current round.
    ///
    /// Votes from non-candidates and votes for rounds already left behind
    /// are ignored. Votes for later rounds are kept until that round is
    /// collected. Only the first vote of a voter in a round counts.
    pub fn record_vote(&mut self, vote: Vote) -> RoundOutcome {
        if let Some(winner) = self.winner {
            return RoundOutcome::Decided(winner);
        }
        if !self.candidates.contains(&vote.voter) {
            trace!(voter = %vote.voter, "ignoring vote from non-candidate");
            return RoundOutcome::Pending;
        }
        if vote.round < self.round {
            trace!(voter = %vote.voter, round = vote.round, "ignoring stale vote");
            return RoundOutcome::Pending;
        }

        self.ballots
            .entry(vote.round)
            .or_default()
            .entry(vote.voter)
            .or_insert(vote.controller);

        if vote.round == self.round {
            self.evaluate()
        } else {
            RoundOutcome::Pending
        }
    }

    /// Evaluates the current round without recording anything.
    fn evaluate(&mut self) -> RoundOutcome {
        let Some(ballot) = self.ballots.get(&self.round) else {
            return RoundOutcome::Pending;
        };
        if ballot.len() < self.candidates.len() {
            return RoundOutcome::Pending;
        }

        let mut tally: BTreeMap<NodeId, usize> = BTreeMap::new();
        for proposed in ballot.values() {
            *tally.entry(*proposed).or_insert(0) += 1;
        }

        let quorum = Self::quorum(self.candidates.len());
        if let Some((&winner, _)) = tally.iter().find(|&(_, &votes)| votes >= quorum) {
            debug!(round = self.round, %winner, "election decided");
            self.winner = Some(winner);
            self.ballots.clear();
            return RoundOutcome::Decided(winner);
        }

        // all votes in, no quorum: converge on the largest proposal
        let proposal = ballot
            .values()
            .copied()
            .max()
            .unwrap_or(self.local_id);
        self.ballots.remove(&self.round);
        self.round += 1;
        self.proposal = proposal;
        debug!(round = self.round, %proposal, "election advancing to next round");
        RoundOutcome::NextRound {
            round: self.round,
            proposal,
        }
    }
}
