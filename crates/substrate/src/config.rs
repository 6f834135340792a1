/// Creation-time configuration for one isolation unit.
///
/// Per-execution limits are not part of unit creation; they arrive later
/// through [`crate::SandboxPolicy`] so a pooled unit can serve requests
/// with different resource grants.
pub struct UnitConfig {
    pub id: uuid::Uuid,
    /// Runtime profile the unit is provisioned for (e.g. "python").
    pub runtime: String,
}
