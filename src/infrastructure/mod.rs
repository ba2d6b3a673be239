pub mod disk;
pub mod p2p;
pub mod persist;
pub mod server;
pub mod wallet;
