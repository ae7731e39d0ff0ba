use std::fmt;

#[derive(Debug)]
pub enum SiftError {
    Io(std::io::Error),
    Encode(Box<bincode::error::EncodeError>),
    Decode(Box<bincode::error::DecodeError>),
    Corrupt(String),
    Search(String),
    Config(String),
}

impl fmt::Display for SiftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiftError::Io(e) => write!(f, "IO error: {}", e),
            SiftError::Encode(e) => write!(f, "Serialization error: {}", e),
            SiftError::Decode(e) => write!(f, "Deserialization error: {}", e),
            SiftError::Corrupt(e) => write!(f, "Corrupt data: {}", e),
            SiftError::Search(e) => write!(f, "Search error: {}", e),
            SiftError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for SiftError {}

impl From<std::io::Error> for SiftError {
    fn from(err: std::io::Error) -> Self {
        SiftError::Io(err)
    }
}

impl From<Box<bincode::error::EncodeError>> for SiftError {
    fn from(err: Box<bincode::error::EncodeError>) -> Self {
        SiftError::Encode(err)
    }
}

impl From<bincode::error::EncodeError> for SiftError {
    fn from(err: bincode::error::EncodeError) -> Self {
        SiftError::Encode(Box::new(err))
    }
}

impl From<Box<bincode::error::DecodeError>> for SiftError {
    fn from(err: Box<bincode::error::DecodeError>) -> Self {
        SiftError::Decode(err)
    }
}

impl From<bincode::error::DecodeError> for SiftError {
    fn from(err: bincode::error::DecodeError) -> Self {
        SiftError::Decode(Box::new(err))
    }
}
