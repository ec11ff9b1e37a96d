//! Control loop phases and verdict reduction

use std::fmt;

/// Points in a control loop iteration where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Start of every iteration, before any pipe is visited
    AtNewEpisode,
    /// Start of every pipe visit
    AtFirst,
    /// Predicate: may an offline pipe be torn down?
    BeforeDestroy,
    AfterDestroy,
    /// A predicate refused the action for this visit
    AtFailed,
    AfterUpload,
    AfterDownload,
    AtZombie,
    /// Predicate: may the peer's contribution be downloaded?
    BeforeDownload,
    /// Predicate: may the model be uploaded to the peer?
    BeforeUpload,
    AtInvalidState,
    /// End of every pipe visit; round-level triggers live here
    AtLast,
}

impl Phase {
    pub const ALL: [Phase; 12] = [
        Phase::AtNewEpisode,
        Phase::AtFirst,
        Phase::BeforeDestroy,
        Phase::AfterDestroy,
        Phase::AtFailed,
        Phase::AfterUpload,
        Phase::AfterDownload,
        Phase::AtZombie,
        Phase::BeforeDownload,
        Phase::BeforeUpload,
        Phase::AtInvalidState,
        Phase::AtLast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::AtNewEpisode => "AT_NEW_EPISODE",
            Phase::AtFirst => "AT_FIRST",
            Phase::BeforeDestroy => "BEFORE_DESTROY",
            Phase::AfterDestroy => "AFTER_DESTROY",
            Phase::AtFailed => "AT_FAILED",
            Phase::AfterUpload => "AFTER_UPLOAD",
            Phase::AfterDownload => "AFTER_DOWNLOAD",
            Phase::AtZombie => "AT_ZOMBIE",
            Phase::BeforeDownload => "BEFORE_DOWNLOAD",
            Phase::BeforeUpload => "BEFORE_UPLOAD",
            Phase::AtInvalidState => "AT_INVALID_STATE",
            Phase::AtLast => "AT_LAST",
        }
    }

    /// Phases whose verdict gates an action
    pub fn is_predicate(&self) -> bool {
        matches!(
            self,
            Phase::BeforeDestroy | Phase::BeforeDownload | Phase::BeforeUpload
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hook's answer. `None` abstains from deciding.
pub type Verdict = Option<bool>;

/// Combine hook verdicts: any abstention wins, then any refusal, else
/// approval. No verdicts at all approve.
pub fn reduce_verdicts<I>(verdicts: I) -> Verdict
where
    I: IntoIterator<Item = Verdict>,
{
    let mut approved = true;
    for verdict in verdicts {
        match verdict {
            None => return None,
            Some(false) => approved = false,
            Some(true) => {}
        }
    }
    Some(approved)
}
