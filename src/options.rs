//! Parsing strictness shared by every decoder in the crate.

/// Binary parsing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Standard parsing mode - only interprets what the format documents
    #[default]
    Strict,
    /// Permissive parsing mode - applies best-effort recovery heuristics,
    /// e.g. reading RVAs that precede the first section as file offsets
    Permissive,
}

impl ParseMode {
    /// Check if this is permissive mode
    pub fn is_permissive(&self) -> bool {
        matches!(self, ParseMode::Permissive)
    }
}

/// Helper trait to ease permissive parsing fallbacks.
///
/// When `permissive` is true, errors are downgraded to warnings and the provided
/// value is used instead; otherwise the original error is propagated.
pub(crate) trait Permissive<T, E> {
    fn or_permissive_and_then<F>(
        self,
        permissive: bool,
        context: &str,
        f: F,
    ) -> core::result::Result<T, E>
    where
        F: FnOnce() -> T;
}

impl<T, E: core::fmt::Display> Permissive<T, E> for core::result::Result<T, E> {
    fn or_permissive_and_then<F>(
        self,
        permissive: bool,
        context: &str,
        f: F,
    ) -> core::result::Result<T, E>
    where
        F: FnOnce() -> T,
    {
        self.or_else(|e| {
            if permissive {
                log::warn!("{context}: {e}, continuing with computed value");
                Ok(f())
            } else {
                Err(e)
            }
        })
    }
}
