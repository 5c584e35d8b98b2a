//! `who:what` alias strings.
//!
//! An alias either names this container (`what` alone, or an empty
//! `who`) or grants another container an extra name for reaching this
//! one (`who:what`: container `who` can resolve `what`).

/// A parsed alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    /// Container the alias is scoped to; empty means self.
    pub who: String,
    pub what: String,
}

impl Alias {
    /// Parses `spec`. A bare name is a self-alias.
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((who, what)) => Self {
                who: who.to_owned(),
                what: what.to_owned(),
            },
            None => Self {
                who: String::new(),
                what: spec.to_owned(),
            },
        }
    }

    #[must_use]
    pub fn is_self(&self) -> bool {
        self.who.is_empty()
    }
}
