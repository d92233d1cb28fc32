pub mod sse;
pub mod stream;
pub mod wallet;
