mod blocking;
mod error;
mod host;
mod native;
mod pool;
