use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};
use thiserror::Error;

pub type PlayerId = String;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Team {
    Red,
    Blue,
}

impl Team {
    pub const ALL: [Team; 2] = [Team::Red, Team::Blue];

    /// Accepts exactly `"red"` or `"blue"`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "red" => Some(Team::Red),
            "blue" => Some(Team::Blue),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Team::Red => "red",
            Team::Blue => "blue",
        }
    }

    pub fn opponent(self) -> Self {
        match self {
            Team::Red => Team::Blue,
            Team::Blue => Team::Red,
        }
    }
}

/// One value per team. Used for scores, flags and derived counts.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PerTeam<T> {
    pub red: T,
    pub blue: T,
}

impl<T> Index<Team> for PerTeam<T> {
    type Output = T;

    fn index(&self, team: Team) -> &T {
        match team {
            Team::Red => &self.red,
            Team::Blue => &self.blue,
        }
    }
}

impl<T> IndexMut<Team> for PerTeam<T> {
    fn index_mut(&mut self, team: Team) -> &mut T {
        match team {
            Team::Red => &mut self.red,
            Team::Blue => &mut self.blue,
        }
    }
}

pub type Scores = PerTeam<i64>;
pub type TeamCounts = PerTeam<usize>;
pub type Flags = PerTeam<Flag>;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlagStatus {
    #[default]
    Home,
    Taken,
    Dropped,
    Captured,
}

impl FlagStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "home" => Some(FlagStatus::Home),
            "taken" => Some(FlagStatus::Taken),
            "dropped" => Some(FlagStatus::Dropped),
            "captured" => Some(FlagStatus::Captured),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Flag {
    pub status: FlagStatus,
    pub carrier: PlayerId,
}

impl Flag {
    fn new(status: FlagStatus, carrier: impl Into<PlayerId>) -> Self {
        Self {
            status,
            carrier: carrier.into(),
        }
    }
}

/// The whole session. Serialized as-is for the snapshot file.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub assignments: BTreeMap<PlayerId, Team>,
    pub scores: Scores,
    pub flags: Flags,
    pub flag_transforms: Map<String, Value>,
}

/// Read view handed to clients: stored fields plus derived team counts.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub counts: TeamCounts,
    pub assignments: BTreeMap<PlayerId, Team>,
    pub scores: Scores,
    pub flags: Flags,
    pub flag_transforms: Map<String, Value>,
}

/// Outcome of [`GameState::set_flag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagUpdate {
    pub flag: Team,
    /// Set only when the flag was captured; names the team that scored.
    pub scored: Option<Team>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid payload")]
    InvalidPayload,
    #[error("invalid team")]
    InvalidTeam,
    #[error("invalid flag")]
    InvalidFlag,
    #[error("invalid state")]
    InvalidStatus,
}

impl GameState {
    pub fn counts(&self) -> TeamCounts {
        let mut counts = TeamCounts::default();
        for team in self.assignments.values() {
            counts[*team] += 1;
        }
        counts
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            counts: self.counts(),
            assignments: self.assignments.clone(),
            scores: self.scores.clone(),
            flags: self.flags.clone(),
            flag_transforms: self.flag_transforms.clone(),
        }
    }

    /// Puts `player_id` on `team`, replacing any earlier assignment.
    pub fn assign(&mut self, player_id: &str, team: &str) -> Result<Team, StateError> {
        if player_id.is_empty() {
            return Err(StateError::InvalidPayload);
        }
        let team = Team::parse(team).ok_or(StateError::InvalidPayload)?;
        self.assignments.insert(player_id.to_string(), team);
        Ok(team)
    }

    pub fn apply_score(&mut self, team: &str, delta: i64) -> Result<&Scores, StateError> {
        let team = Team::parse(team).ok_or(StateError::InvalidTeam)?;
        self.scores[team] = self.scores[team].saturating_add(delta);
        Ok(&self.scores)
    }

    /// Records a flag status change.
    ///
    /// A capture is momentary: the scoring team gets one point and the flag
    /// goes straight back home, so `captured` is never stored. The point goes
    /// to the carrier's team when the carrier is assigned, otherwise to the
    /// flag owner's opponent.
    pub fn set_flag(
        &mut self,
        flag: &str,
        status: &str,
        carrier: &str,
    ) -> Result<FlagUpdate, StateError> {
        let flag = Team::parse(flag).ok_or(StateError::InvalidFlag)?;
        let status = FlagStatus::parse(status).ok_or(StateError::InvalidStatus)?;

        if status != FlagStatus::Captured {
            self.flags[flag] = Flag::new(status, carrier);
            return Ok(FlagUpdate { flag, scored: None });
        }

        let scorer = self
            .carrier_team(carrier)
            .unwrap_or_else(|| flag.opponent());
        self.scores[scorer] = self.scores[scorer].saturating_add(1);
        self.flags[flag] = Flag::default();
        Ok(FlagUpdate {
            flag,
            scored: Some(scorer),
        })
    }

    fn carrier_team(&self, carrier: &str) -> Option<Team> {
        if carrier.is_empty() {
            return None;
        }
        self.assignments.get(carrier).copied()
    }

    /// Bulk sync from an external authority.
    ///
    /// Each field is handled on its own and malformed entries are skipped.
    /// Scores only ever move up through this path, and flags are overwritten
    /// verbatim without capture scoring.
    pub fn merge(&mut self, patch: &Value) {
        let Some(patch) = patch.as_object() else {
            return;
        };

        if let Some(assignments) = patch.get("assignments").and_then(Value::as_object) {
            for (player_id, team) in assignments {
                if let Some(team) = team.as_str().and_then(Team::parse) {
                    self.assignments.insert(player_id.clone(), team);
                }
            }
        }

        if let Some(scores) = patch.get("scores").and_then(Value::as_object) {
            for team in Team::ALL {
                if let Some(provided) = scores.get(team.as_str()).and_then(whole_number) {
                    self.scores[team] = self.scores[team].max(provided);
                }
            }
        }

        if let Some(flags) = patch.get("flags").and_then(Value::as_object) {
            for team in Team::ALL {
                if let Some(flag) = flags.get(team.as_str()).and_then(parse_flag) {
                    self.flags[team] = flag;
                }
            }
        }

        if let Some(transforms) = patch.get("flagTransforms").and_then(Value::as_object) {
            self.flag_transforms = transforms.clone();
        }
    }

    /// Loads a previously persisted document.
    ///
    /// Every top-level field present as an object replaces the in-memory
    /// field wholesale; absent or non-object fields keep their current value.
    pub fn restore(&mut self, doc: &Value) {
        let Some(doc) = doc.as_object() else {
            return;
        };

        if let Some(assignments) = doc.get("assignments").and_then(Value::as_object) {
            self.assignments = assignments
                .iter()
                .filter_map(|(player_id, team)| {
                    let team = team.as_str().and_then(Team::parse)?;
                    Some((player_id.clone(), team))
                })
                .collect();
        }

        if let Some(scores) = doc.get("scores").and_then(Value::as_object) {
            let score_of = |team: Team| {
                scores
                    .get(team.as_str())
                    .and_then(whole_number)
                    .unwrap_or(0)
            };
            self.scores = Scores {
                red: score_of(Team::Red),
                blue: score_of(Team::Blue),
            };
        }

        if let Some(flags) = doc.get("flags").and_then(Value::as_object) {
            let flag_of = |team: Team| {
                flags
                    .get(team.as_str())
                    .and_then(parse_flag)
                    .unwrap_or_default()
            };
            self.flags = Flags {
                red: flag_of(Team::Red),
                blue: flag_of(Team::Blue),
            };
        }

        if let Some(transforms) = doc.get("flagTransforms").and_then(Value::as_object) {
            self.flag_transforms = transforms.clone();
        }
    }
}

/// Integer view of a JSON number; fractions are truncated toward zero.
pub fn whole_number(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|n| n.is_finite())
            .map(|n| n.trunc() as i64)
    })
}

fn parse_flag(value: &Value) -> Option<Flag> {
    let record = value.as_object()?;
    let status = record
        .get("status")
        .or_else(|| record.get("state"))
        .and_then(Value::as_str)
        .and_then(FlagStatus::parse)?;
    let carrier = record
        .get("carrier")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(Flag::new(status, carrier))
}
