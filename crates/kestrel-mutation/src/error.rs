/// Errors raised while validating and planning mutations.
#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "cannot UPDATE column '{column}': {reason}")]
    CannotUpdateColumn { column: String, reason: String },
    #[display(fmt = "there is no column '{column}' in table")]
    NoSuchColumn { column: String },
    #[display(fmt = "unknown mutation command '{kind}'")]
    UnknownMutationCommand { kind: String },
    #[display(fmt = "unknown index '{name}'")]
    UnknownIndex { name: String },
    #[display(fmt = "error scanning storage")]
    Scan,
    #[display(fmt = "internal error: {_0}")]
    Internal(String),
}

impl error_stack::Context for Error {}
