/// Typed errors surfaced by the strict loader entry points.
///
/// Failures thrown by user callbacks are not re-raised eagerly; they are
/// captured per object and only surface here through the strict variants.
#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "no such {type_name} '{name}'")]
    NoSuchObject { type_name: String, name: String },
    #[display(fmt = "{type_name} '{name}' is still loading")]
    StillLoading { type_name: String, name: String },
    #[display(fmt = "failed to load {type_name} '{name}'")]
    LoadFailed { type_name: String, name: String },
    #[display(fmt = "cyclic load: {type_name} '{name}' requires itself")]
    CyclicLoad { type_name: String, name: String },
}

impl error_stack::Context for Error {}
