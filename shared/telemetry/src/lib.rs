mod logging;

pub use logging::{logging, LogOutput, LoggingBuilder};
