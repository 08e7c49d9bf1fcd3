//! Named partitions of an index

/// Names given to proportions passed without explicit names, in order
pub const DEFAULT_SPLIT_NAMES: [&str; 3] = ["train", "test", "validation"];

/// Disjoint named parts cut from one index, plus the keys left over
///
/// `T` is whatever the parts are scoped as: an index, a dataset, or a paired
/// dataset. The remainder holds keys no proportion covered; it has no name
/// and takes part in nothing unless the caller picks it up explicitly.
#[derive(Debug, Clone)]
pub struct Split<T> {
    parts: Vec<(String, T)>,
    remainder: T,
}

impl<T> Split<T> {
    pub(crate) fn new(parts: Vec<(String, T)>, remainder: T) -> Self {
        Self { parts, remainder }
    }

    /// Part by name
    pub fn get(&self, name: &str) -> Option<&T> {
        self.parts.iter().find(|(n, _)| n == name).map(|(_, part)| part)
    }

    /// Mutable part by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.parts.iter_mut().find(|(n, _)| n == name).map(|(_, part)| part)
    }

    /// The `train` part
    pub fn train(&self) -> Option<&T> {
        self.get("train")
    }

    /// The `test` part
    pub fn test(&self) -> Option<&T> {
        self.get("test")
    }

    /// The `validation` part
    pub fn validation(&self) -> Option<&T> {
        self.get("validation")
    }

    /// Mutable `train` part
    pub fn train_mut(&mut self) -> Option<&mut T> {
        self.get_mut("train")
    }

    /// Mutable `test` part
    pub fn test_mut(&mut self) -> Option<&mut T> {
        self.get_mut("test")
    }

    /// Mutable `validation` part
    pub fn validation_mut(&mut self) -> Option<&mut T> {
        self.get_mut("validation")
    }

    /// Keys not assigned to any named part
    pub fn remainder(&self) -> &T {
        &self.remainder
    }

    /// Part names in the order they were requested
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(|(name, _)| name.as_str())
    }

    /// Named parts in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.parts.iter().map(|(name, part)| (name.as_str(), part))
    }

    /// Number of named parts
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether there are no named parts
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Remove a part by name and take ownership of it
    pub fn take(&mut self, name: &str) -> Option<T> {
        let position = self.parts.iter().position(|(n, _)| n == name)?;
        Some(self.parts.remove(position).1)
    }

    /// Consume into named parts and remainder
    pub fn into_parts(self) -> (Vec<(String, T)>, T) {
        (self.parts, self.remainder)
    }

    /// Convert every part (and the remainder) with a fallible function
    pub fn try_map<U, E, F>(self, mut f: F) -> Result<Split<U>, E>
    where
        F: FnMut(&str, T) -> Result<U, E>,
    {
        let parts = self
            .parts
            .into_iter()
            .map(|(name, part)| {
                let mapped = f(&name, part)?;
                Ok((name, mapped))
            })
            .collect::<Result<Vec<_>, E>>()?;
        let remainder = f("", self.remainder)?;
        Ok(Split { parts, remainder })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_take() {
        let mut split = Split::new(
            vec![("train".to_string(), 1), ("test".to_string(), 2)],
            0,
        );
        assert_eq!(split.train(), Some(&1));
        assert_eq!(split.test(), Some(&2));
        assert_eq!(split.validation(), None);
        assert_eq!(split.names().collect::<Vec<_>>(), vec!["train", "test"]);

        *split.train_mut().unwrap() += 10;
        assert_eq!(split.take("train"), Some(11));
        assert_eq!(split.len(), 1);
    }

    #[test]
    fn test_try_map_stops_on_error() {
        let split = Split::new(vec![("a".to_string(), 1), ("b".to_string(), -1)], 0);
        let result: Result<Split<u32>, String> =
            split.try_map(|name, v| u32::try_from(v).map_err(|_| name.to_string()));
        assert_eq!(result.unwrap_err(), "b");
    }
}
