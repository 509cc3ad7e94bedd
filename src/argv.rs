//! `make_argv` (§6): splits a command string into argv the way a POSIX
//! shell would — single/double-quote grouping and backslash escapes, with
//! no actual shell invoked.

/// Splits `command` into arguments. Single quotes suppress all escaping
/// inside them; double quotes allow `\"` and `\\` but otherwise pass
/// content through literally; unquoted backslashes escape the next
/// character. Unterminated quotes consume to the end of the string rather
/// than erroring, matching a permissive embedded-shell parser.
pub fn make_argv(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = command.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            '\'' => {
                in_arg = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_arg = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(&next) = chars.peek() {
                                if next == '"' || next == '\\' {
                                    current.push(next);
                                    chars.next();
                                    continue;
                                }
                            }
                            current.push('\\');
                        }
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_arg = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            other => {
                in_arg = true;
                current.push(other);
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(make_argv("one two  three"), vec!["one", "two", "three"]);
    }

    #[test]
    fn single_quotes_suppress_escapes() {
        assert_eq!(make_argv(r#"echo 'a b\c'"#), vec!["echo", "a b\\c"]);
    }

    #[test]
    fn double_quotes_allow_backslash_escapes() {
        assert_eq!(make_argv(r#"echo "a \"b\" c""#), vec!["echo", "a \"b\" c"]);
    }

    #[test]
    fn unquoted_backslash_escapes_next_char() {
        assert_eq!(make_argv(r"one\ two"), vec!["one two"]);
    }

    #[test]
    fn empty_command_yields_no_args() {
        assert_eq!(make_argv("   "), Vec::<String>::new());
    }
}
