// concord-common: wire types, quorum record and snapshot tree builder shared
// by the relay and its clients.

pub mod protocol;
pub mod quorum;
pub mod tree;
