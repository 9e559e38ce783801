//! Paths split into a fixed root and a movable sub path
//!
//! Tracked objects store only the sub path relative to the synchronized root.
//! [`RelativePath`] keeps both parts so that full and relative forms can be
//! derived without string juggling at every call site.

use std::path::{Path, PathBuf};

use crate::layout::DOT_DIR;

/// Longest identifier accepted from a peer
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

/// A root path plus a sub path beneath it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativePath {
	stack: Vec<String>,
	limit: usize,
}

fn sanitize(path: &str) -> impl Iterator<Item = String> + '_ {
	path.split('/').filter(|s| !s.is_empty()).map(str::to_string)
}

impl RelativePath {
	/// A path consisting only of the root
	pub fn root(root: &str) -> Self {
		let stack: Vec<String> = sanitize(root).collect();
		let limit = stack.len();
		RelativePath { stack, limit }
	}

	/// A root with a sub path already selected
	pub fn new(root: &str, subpath: &str) -> Self {
		let mut path = Self::root(root);
		path.stack.extend(sanitize(subpath));
		path
	}

	/// Build from filesystem paths; non UTF-8 components are replaced lossily
	pub fn from_paths(root: &Path, subpath: &Path) -> Self {
		Self::new(&root.to_string_lossy(), &subpath.to_string_lossy())
	}

	pub fn full_path(&self) -> String {
		format!("/{}", self.stack.join("/"))
	}

	pub fn to_path_buf(&self) -> PathBuf {
		PathBuf::from(self.full_path())
	}

	pub fn root_path(&self) -> String {
		format!("/{}", self.stack[..self.limit].join("/"))
	}

	/// Sub path without leading slash; empty for the root itself
	pub fn subpath(&self) -> String {
		self.stack[self.limit..].join("/")
	}

	/// Last element of the full path
	pub fn last_element(&self) -> &str {
		self.stack.last().map(String::as_str).unwrap_or("")
	}

	pub fn depth(&self) -> usize {
		self.stack.len()
	}

	pub fn is_root(&self) -> bool {
		self.stack.len() == self.limit
	}

	/// Replace the sub path.
	///
	/// An absolute path must lie beneath the same root, otherwise an unchanged
	/// copy is returned. A relative path replaces the current sub path.
	pub fn apply(&self, path: &str) -> Self {
		if path.starts_with('/') {
			let candidate = Self::root(path);
			if candidate.stack.len() < self.limit
				|| candidate.stack[..self.limit] != self.stack[..self.limit]
			{
				return self.clone();
			}
			return RelativePath { stack: candidate.stack, limit: self.limit };
		}
		Self::new(&self.root_path(), path)
	}

	/// Descend into a child element
	pub fn join(&self, element: &str) -> Self {
		let mut path = self.clone();
		path.stack.extend(sanitize(element));
		path
	}

	/// Drop the last element, never going above the root
	pub fn up(&self) -> Self {
		let pop = self.stack.len().saturating_sub(1).max(self.limit);
		RelativePath { stack: self.stack[..pop].to_vec(), limit: self.limit }
	}
}

/// Parent of a relative sub path; empty string for top level entries
pub fn parent_of(subpath: &str) -> &str {
	match subpath.rfind('/') {
		Some(idx) => &subpath[..idx],
		None => "",
	}
}

/// True if `path` lies strictly beneath the directory `dir` (both sub paths)
pub fn is_beneath(dir: &str, path: &str) -> bool {
	if dir.is_empty() {
		return !path.is_empty();
	}
	path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// Whether `identification` can name a file inside the marker directory:
/// ASCII letters, digits, `-` and `_` only.
pub fn is_valid_identifier(identification: &str) -> bool {
	!identification.is_empty()
		&& identification.len() <= MAX_IDENTIFIER_LENGTH
		&& identification.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Whether `subpath` names something inside the synchronized root and
/// outside the marker directory. Absolute paths and empty, `.` or `..`
/// elements are refused.
pub fn is_safe_subpath(subpath: &str) -> bool {
	if subpath.is_empty() || subpath.starts_with('/') || subpath.contains(['\\', '\0']) {
		return false;
	}
	let mut elements = subpath.split('/').peekable();
	if elements.peek() == Some(&DOT_DIR) {
		return false;
	}
	elements.all(|e| !e.is_empty() && e != "." && e != "..")
}


// vim: ts=4
