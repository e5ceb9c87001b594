/// Errors reported by hash table operations.
#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "no available data")]
    NoAvailableData,
    #[display(fmt = "allocation of {_0} cells failed")]
    AllocationFailed(usize),
    #[display(fmt = "malformed text input")]
    MalformedInput,
    #[display(fmt = "error writing serialized table")]
    Write,
}

impl error_stack::Context for Error {}
