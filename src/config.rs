//! Render-time configuration.
//!
//! Mirrors Velocity's own handful of engine-wide switches rather than
//! inventing new ones: whether an undefined reference is an error or a
//! silent literal echo, and whether arithmetic on `null` is an error or
//! treated as zero.

/// Knobs that change evaluator behavior. Construct with [`Options::default`]
/// and override what you need; these mirror Velocity's `runtime.references.strict`
/// and `runtime.strict_math` switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// When `true`, a non-quiet reference that resolves to nothing is a
    /// [`crate::error::Error::Execution`] instead of being echoed back as
    /// literal source text. Velocity defaults this to `false`.
    pub strict_references: bool,
    /// When `true`, an arithmetic operand that is `null` is a
    /// [`crate::error::Error::Execution`] instead of being treated as zero.
    pub strict_math: bool,
}
