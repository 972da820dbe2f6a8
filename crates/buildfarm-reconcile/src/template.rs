//! Stack templates embedded at build time.

/// The three kinds of stack a farm is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackTemplate {
    Infra,
    Server,
    Worker,
}

impl StackTemplate {
    pub fn body(self) -> &'static str {
        match self {
            StackTemplate::Infra => include_str!("../templates/infra.json"),
            StackTemplate::Server => include_str!("../templates/server.json"),
            StackTemplate::Worker => include_str!("../templates/worker.json"),
        }
    }
}
