use crate::context::ContextOwner;
use crate::program::ProgramKind;

/// Failures raised while compiling or rendering on a surface.
///
/// Compile and channel-load failures are local to one tile or channel and
/// never abort a tick. Context failures are surfaced to the scheduler, which
/// skips the tick instead of drawing with known-bad state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error("failed to compile {kind} program: {message}")]
    Compile { kind: ProgramKind, message: String },
    #[error("failed to load channel {channel} from '{reference}': {message}")]
    ChannelLoad {
        channel: usize,
        reference: String,
        message: String,
    },
    #[error("graphics context unavailable: {0}")]
    ContextUnavailable(String),
    #[error("graphics context state could not be restored for {owner}: {message}")]
    ContextCorrupted { owner: ContextOwner, message: String },
    #[error("surface error: {0}")]
    Surface(String),
}

impl RenderError {
    pub fn compile(kind: ProgramKind, message: impl Into<String>) -> Self {
        Self::Compile {
            kind,
            message: message.into(),
        }
    }

    /// True when the failure invalidates the shared context for the rest of the tick.
    pub fn skips_tick(&self) -> bool {
        matches!(
            self,
            RenderError::ContextUnavailable(_)
                | RenderError::ContextCorrupted { .. }
                | RenderError::Surface(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_context_failures_skip_the_tick() {
        assert!(!RenderError::compile(ProgramKind::Shader, "bad").skips_tick());
        assert!(!RenderError::ChannelLoad {
            channel: 1,
            reference: "noise.png".into(),
            message: "missing".into(),
        }
        .skips_tick());
        assert!(RenderError::ContextUnavailable("lost".into()).skips_tick());
        assert!(RenderError::ContextCorrupted {
            owner: ContextOwner::Tile(2),
            message: "stale".into(),
        }
        .skips_tick());
    }
}
