/// Error type shared by every stage of the fuzzer. Only conditions that
/// should abort the session are errors; noisy measurements, filtered
/// divergences and invalid inputs are ordinary values
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FuzzErr {
    /// Malformed program or input, a broken generator invariant
    #[error("generation fault: {0}")]
    Generation(String),

    /// Bad user configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The hardware harness could not be set up or driven
    #[error("executor failure: {0}")]
    Executor(String),

    /// The encoder refused an instruction out of the catalog
    #[error("assembler failure: {0}")]
    Assembler(String),
}

impl FuzzErr {
    pub fn generation(message: &str) -> Self {
        FuzzErr::Generation(message.to_string())
    }

    pub fn config(message: &str) -> Self {
        FuzzErr::Config(message.to_string())
    }

    pub fn executor(message: &str) -> Self {
        FuzzErr::Executor(message.to_string())
    }

    /// Executor error carrying the current `errno` description
    pub fn os(context: &str) -> Self {
        FuzzErr::Executor(format!(
            "{}: {}",
            context,
            std::io::Error::last_os_error()
        ))
    }

    pub fn display(&self) {
        println!("{}", self);
    }
}

impl From<iced_x86::IcedError> for FuzzErr {
    fn from(err: iced_x86::IcedError) -> Self {
        FuzzErr::Assembler(err.to_string())
    }
}
