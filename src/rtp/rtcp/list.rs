use std::ops::Index;

/// Max number of report blocks in one SR/RR. The count field is 5 bits.
pub const MAX_REPORTS: usize = 31;

/// List of report blocks, capped at [`MAX_REPORTS`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportList<T>(Vec<T>);

impl<T> ReportList<T> {
    pub(crate) fn new() -> Self {
        ReportList(Vec::with_capacity(4))
    }

    /// Number of elements in the list.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Tells if the list contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add an element. Returns the element back if the list is full.
    pub fn push(&mut self, v: T) -> Result<(), T> {
        if self.is_full() {
            return Err(v);
        }
        self.0.push(v);
        Ok(())
    }

    /// Get element at position.
    pub fn get(&self, i: usize) -> Option<&T> {
        self.0.get(i)
    }

    /// Iterator over the elements in the list.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    /// Split any number of items into lists of at most [`MAX_REPORTS`].
    pub fn lists_from_iter(iterator: impl IntoIterator<Item = T>) -> Vec<Self> {
        let mut result = vec![];
        let mut current = Self::new();

        for item in iterator {
            if current.is_full() {
                result.push(current);
                current = Self::new();
            }
            current.0.push(item);
        }

        if !current.is_empty() {
            result.push(current);
        }

        result
    }

    pub(crate) fn is_full(&self) -> bool {
        self.0.len() == MAX_REPORTS
    }
}

impl<T: WordSized> ReportList<T> {
    /// Move as many items as fit from `other` into self. Returns number of moved items.
    pub(crate) fn append_all_possible(&mut self, other: &mut Self, mut words_left: usize) -> usize {
        let max = (MAX_REPORTS - self.len()).min(other.len());

        let mut moved = 0;
        while moved < max {
            let item_size = other.0[moved].word_size();
            if words_left < item_size {
                break;
            }
            words_left -= item_size;
            moved += 1;
        }

        self.0.extend(other.0.drain(..moved));

        moved
    }
}

/// Size of an item in 4 byte words.
pub(crate) trait WordSized {
    fn word_size(&self) -> usize;
}

impl<T> Index<usize> for ReportList<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl<T> Default for ReportList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T> IntoIterator for &'a ReportList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<T> IntoIterator for ReportList<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<T> From<T> for ReportList<T> {
    fn from(t: T) -> Self {
        ReportList(vec![t])
    }
}
