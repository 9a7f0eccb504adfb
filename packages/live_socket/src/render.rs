use std::fmt;
use std::sync::Arc;

/// Output of one render cycle. Cheap to clone, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rendered(Arc<str>);

impl Rendered {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Rendered {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&str> for Rendered {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl fmt::Display for Rendered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces a view from the current assigns.
///
/// Implementations must be pure: the same assigns always give the same output.
pub trait Renderer<A>: Send + Sync + 'static {
    fn render(&self, assigns: &A) -> anyhow::Result<Rendered>;
}

impl<A, F, R> Renderer<A> for F
where
    F: Fn(&A) -> anyhow::Result<R> + Send + Sync + 'static,
    R: Into<Rendered>,
{
    fn render(&self, assigns: &A) -> anyhow::Result<Rendered> {
        self(assigns).map(Into::into)
    }
}
