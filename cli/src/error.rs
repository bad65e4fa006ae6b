use std::{fmt::Display, io};

use badgelink::ProtocolError;

pub enum CliError {
    IO(io::Error),
    Protocol(ProtocolError),
    InvalidBinding(String),
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::IO(value)
    }
}

impl From<ProtocolError> for CliError {
    fn from(value: ProtocolError) -> Self {
        CliError::Protocol(value)
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::IO(err) => write!(f, "IO error: {err}"),
            CliError::Protocol(err) => write!(f, "{err}"),
            CliError::InvalidBinding(binding) => {
                write!(f, "Invalid binding '{binding}'")
            }
        }
    }
}
