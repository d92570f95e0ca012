// botwave: Workspace facade.
//
// The real code lives in the member crates; this package exists to anchor
// the end-to-end integration suites under tests/integration/.

pub use bw_protocol::PROTOCOL_VERSION;
