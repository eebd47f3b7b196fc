// Path glob matching for `changes:` and `refs:`
// Supports `*`, `?`, `[abc]`/`[a-z]`/`[!x]` within a segment and `**` across segments

/// Match a slash-separated path against a glob pattern
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = split_segments(pattern);
    let path: Vec<&str> = split_segments(path);
    match_segments(&pattern, &path)
}

/// True if any path matches any pattern
pub fn any_match<'a, P>(patterns: &[String], paths: P) -> bool
where
    P: IntoIterator<Item = &'a String>,
{
    paths
        .into_iter()
        .any(|path| patterns.iter().any(|pattern| glob_match(pattern, path)))
}

fn split_segments(value: &str) -> Vec<&str> {
    value
        .trim_start_matches("./")
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((segment, rest)) => match path.split_first() {
            Some((name, path_rest)) => {
                match_segment(segment, name) && match_segments(rest, path_rest)
            }
            None => false,
        },
    }
}

fn match_segment(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    match_chars(&pattern, &name)
}

fn match_chars(pattern: &[char], name: &[char]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some(('*', rest)) => (0..=name.len()).any(|skip| match_chars(rest, &name[skip..])),
        Some(('?', rest)) => !name.is_empty() && match_chars(rest, &name[1..]),
        Some(('[', rest)) => match rest.iter().position(|&c| c == ']') {
            Some(close) if close > 0 => match name.split_first() {
                Some((c, name_rest)) => {
                    class_matches(&rest[..close], *c) && match_chars(&rest[close + 1..], name_rest)
                }
                None => false,
            },
            // No closing bracket, treat '[' literally
            _ => name.first() == Some(&'[') && match_chars(rest, &name[1..]),
        },
        Some((c, rest)) => name.first() == Some(c) && match_chars(rest, &name[1..]),
    }
}

fn class_matches(class: &[char], c: char) -> bool {
    let (negated, class) = match class.split_first() {
        Some(('!' | '^', rest)) => (true, rest),
        _ => (false, class),
    };

    let mut matched = false;
    let mut i = 0;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == '-' {
            if class[i] <= c && c <= class[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if class[i] == c {
                matched = true;
            }
            i += 1;
        }
    }

    matched != negated
}
