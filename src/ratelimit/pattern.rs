//! Request path matching against shell-style glob patterns.
//!
//! Patterns use the familiar shell wildcards: `*` matches any run of
//! characters (including `/`), `?` matches exactly one character, and
//! `[...]` / `[!...]` match one character from (or outside) a set. A pattern
//! ending in `/*` also matches its bare prefix, so `items/*` covers both
//! `items` and `items/MLA123`.

/// Check whether a request path matches a rule pattern.
///
/// A single leading `/` is stripped from the path before comparison.
pub fn matches(path: &str, pattern: &str) -> bool {
    let path = path.strip_prefix('/').unwrap_or(path);

    if let Some(prefix) = pattern.strip_suffix("/*") {
        if path == prefix {
            return true;
        }
    }

    glob_match(path, pattern)
}

/// Full-string glob match with single-star backtracking.
fn glob_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    let mut t = 0;
    let mut p = 0;
    // Position after the most recent `*` and the text index it is currently absorbing up to.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == '*' {
            star = Some((p + 1, t));
            p += 1;
            continue;
        }

        if p < pattern.len() {
            if let Some(next) = match_one(&pattern, p, text[t]) {
                p = next;
                t += 1;
                continue;
            }
        }

        match star {
            Some((resume, absorbed)) => {
                p = resume;
                t = absorbed + 1;
                star = Some((resume, absorbed + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// Match a single non-star pattern element at `p` against `ch`.
///
/// Returns the index of the next pattern element on success.
fn match_one(pattern: &[char], p: usize, ch: char) -> Option<usize> {
    match pattern[p] {
        '?' => Some(p + 1),
        '[' => match parse_class(pattern, p) {
            Some((set, end)) => set.contains(ch).then_some(end),
            // Unterminated set: the bracket is a literal.
            None => (ch == '[').then_some(p + 1),
        },
        c => (c == ch).then_some(p + 1),
    }
}

/// A bracketed character set such as `[a-z0-9]` or `[!_]`.
struct CharClass<'a> {
    negated: bool,
    body: &'a [char],
}

impl CharClass<'_> {
    fn contains(&self, ch: char) -> bool {
        let mut found = false;
        let mut i = 0;
        while i < self.body.len() {
            let lo = self.body[i];
            if i + 2 < self.body.len() && self.body[i + 1] == '-' {
                let hi = self.body[i + 2];
                if lo <= ch && ch <= hi {
                    found = true;
                }
                i += 3;
            } else {
                if lo == ch {
                    found = true;
                }
                i += 1;
            }
        }
        found != self.negated
    }
}

/// Parse a set starting at the `[` at index `start`.
///
/// Returns the set and the index just past its closing `]`, or `None` if the
/// set is never closed. A `]` directly after `[` or `[!` is a literal member.
fn parse_class(pattern: &[char], start: usize) -> Option<(CharClass<'_>, usize)> {
    let mut i = start + 1;
    let negated = pattern.get(i) == Some(&'!');
    if negated {
        i += 1;
    }
    let body_start = i;
    if pattern.get(i) == Some(&']') {
        i += 1;
    }

    while i < pattern.len() {
        if pattern[i] == ']' {
            let class = CharClass {
                negated,
                body: &pattern[body_start..i],
            };
            return Some((class, i + 1));
        }
        i += 1;
    }

    None
}
