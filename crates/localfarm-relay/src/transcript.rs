//! Ordered prompt construction: system directive, bounded history, new turn.

use crate::types::{Role, Turn};

/// Number of prior turns kept in a prompt unless configured otherwise.
pub const DEFAULT_HISTORY_WINDOW: usize = 10;

/// Domain framing sent ahead of every chat exchange.
pub const FARMING_SYSTEM_PROMPT: &str = "You are LocalFarm AI, an expert agricultural assistant \
specializing in farming practices in Niigata, Japan. Provide concise, practical, and actionable \
advice to farmers. Consider local climate, soil conditions, and common crops of the region like \
rice, edamame, and sake rice. Be friendly and supportive.";

/// Framing for one-shot crop advice.
pub const ADVICE_SYSTEM_PROMPT: &str =
    "You are a farming expert specializing in crops in the Niigata region of Japan.";

/// Location assumed by [`advice`].
pub const DEFAULT_LOCATION: &str = "Niigata, Japan";

/// The prompt for one exchange.
///
/// Always starts with a system turn and ends with the new user turn; there is
/// no way to build one in another order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    system: Turn,
    history: Vec<Turn>,
    user: Turn,
}

impl Transcript {
    pub fn system(&self) -> &Turn {
        &self.system
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// The new user turn, the one persisted at the start of a relay.
    pub fn user_turn(&self) -> &Turn {
        &self.user
    }

    /// All turns in conversation order.
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        std::iter::once(&self.system)
            .chain(self.history.iter())
            .chain(std::iter::once(&self.user))
    }
}

/// Build a transcript, keeping only the `window` most recent history turns.
///
/// System turns in `history` are dropped and do not count toward `window`.
/// `new_turn` is recorded as a user turn regardless of the role it carries.
pub fn assemble(system_prompt: &str, history: &[Turn], new_turn: Turn, window: usize) -> Transcript {
    let conversation: Vec<&Turn> = history.iter().filter(|t| t.role != Role::System).collect();
    let skip = conversation.len().saturating_sub(window);
    let history = conversation.into_iter().skip(skip).cloned().collect();

    Transcript {
        system: Turn::system(system_prompt),
        history,
        user: Turn::user(new_turn.content),
    }
}

/// A history-free transcript asking for today's advice on growing `crop`.
pub fn advice(crop: &str, location: &str) -> Transcript {
    let request = format!(
        "Provide brief, practical farming advice for growing {crop} in {location} today. \
         Include tips on watering, pest management, and what to look out for based on the \
         current season."
    );
    assemble(ADVICE_SYSTEM_PROMPT, &[], Turn::user(request), 0)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
