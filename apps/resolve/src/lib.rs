// Library exports for testing
// The binary (main.rs) imports these as well

pub mod arguments;
pub mod error;
pub mod logger;
pub mod resolver;

#[cfg(test)]
mod tests;
