//! Naming of cache generations.

/// The two generation names that are current for one deployed version.
///
/// Any other generation name found in the store is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationNames {
  pub static_name: String,
  pub dynamic_name: String,
}

impl GenerationNames {
  pub fn new(static_prefix: &str, dynamic_prefix: &str, version: &str) -> Self {
    Self {
      static_name: format!("{}-{}", static_prefix, version),
      dynamic_name: format!("{}-{}", dynamic_prefix, version),
    }
  }

  pub fn is_current(&self, name: &str) -> bool {
    name == self.static_name || name == self.dynamic_name
  }

  /// Names from `names` that belong to neither current generation.
  pub fn stale<'a, I>(&self, names: I) -> Vec<&'a str>
  where
    I: IntoIterator<Item = &'a String>,
  {
    names
      .into_iter()
      .map(String::as_str)
      .filter(|name| !self.is_current(name))
      .collect()
  }
}
