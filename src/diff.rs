//! Prefix/suffix text diff.
//!
//! Client edits arrive as whole texts. [`diff`] reduces the change from the
//! last text the client saw to the new one into a single replaced range,
//! measured in characters. The cursor hint resolves ambiguous cases such as
//! typing a letter into a run of the same letter: the edit is placed so it
//! ends at the cursor.

/// Replace `delete` characters at `start` with `insert`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TextEdit {
    pub start: usize,
    pub delete: usize,
    pub insert: String,
}

impl TextEdit {
    pub fn is_noop(&self) -> bool {
        return self.delete == 0 && self.insert.is_empty();
    }
}

/// Compute the edit turning `old` into `new`.
///
/// `cursor` is the caret position in `new` after the edit, in characters.
/// Without it the longest common prefix is taken first.
pub fn diff(old: &str, new: &str, cursor: Option<usize>) -> TextEdit {
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();
    let shortest = old.len().min(new.len());

    let (prefix, suffix) = match cursor {
        Some(cursor) => {
            // The unchanged tail cannot reach left of the cursor.
            let cap = new.len().saturating_sub(cursor.min(new.len())).min(shortest);
            let suffix = common_suffix(&old, &new, cap);
            let prefix = common_prefix(&old, &new, shortest - suffix);
            (prefix, suffix)
        }
        None => {
            let prefix = common_prefix(&old, &new, shortest);
            let suffix = common_suffix(&old, &new, shortest - prefix);
            (prefix, suffix)
        }
    };

    return TextEdit {
        start: prefix,
        delete: old.len() - prefix - suffix,
        insert: new[prefix..new.len() - suffix].iter().collect(),
    };
}

fn common_prefix(a: &[char], b: &[char], limit: usize) -> usize {
    return a.iter().zip(b).take(limit).take_while(|(x, y)| x == y).count();
}

fn common_suffix(a: &[char], b: &[char], limit: usize) -> usize {
    return a.iter().rev().zip(b.iter().rev()).take(limit).take_while(|(x, y)| x == y).count();
}
