use duopack::CodecError;
use duopack::ErrorKind;
use duopack::ErrorValue;
use duopack::Handle;

#[derive(Debug, Clone)]
pub enum Error {
    /// No live entry for this handle.
    NotFound(Handle),
    /// A script imported a module outside the approved set.
    ModuleNotFound(String),
    /// The script's source could not be obtained.
    SourceUnavailable(String),
    /// The script did not compile.
    Compile(String),
    /// A module failed to install into a script's linker.
    Link(String),
    /// The script has no `main` export of type `() -> ()`.
    MissingEntryPoint,
    /// The script trapped during instantiation or while running.
    ScriptExecution(String),
    Rpc(duorpc::Error),
    Codec(CodecError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(handle) => write!(f, "No remote object for {}", handle),
            Self::ModuleNotFound(name) => write!(f, "module not found: {}", name),
            Self::SourceUnavailable(msg) => write!(f, "Script unavailable: {}", msg),
            Self::Compile(msg) => write!(f, "Compile error: {}", msg),
            Self::Link(msg) => write!(f, "Linker error: {}", msg),
            Self::MissingEntryPoint => write!(f, "Script does not export a 'main' function"),
            Self::ScriptExecution(msg) => write!(f, "Script execution error: {}", msg),
            Self::Rpc(e) => write!(f, "RPC error: {}", e),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<duorpc::Error> for Error {
    fn from(e: duorpc::Error) -> Self {
        Self::Rpc(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl Error {
    /// The value reported to the host when a script fails with this error.
    pub fn to_error_value(&self) -> ErrorValue {
        let kind = match self {
            Self::Compile(_) => ErrorKind::SyntaxError,
            Self::ModuleNotFound(_) | Self::MissingEntryPoint => ErrorKind::ReferenceError,
            _ => ErrorKind::Error,
        };
        let value = ErrorValue::new(kind, self.to_string());
        match self {
            Self::Rpc(e) => value.with_cause(e.to_error_value()),
            Self::Codec(e) => value.with_cause(ErrorValue::from_error(e)),
            _ => value,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
