use std::borrow::Cow;

use shell_escape::unix::escape;

use crate::{InvalidInput, Result, validate::find_denied_char};

/// Single-quote escape a value for interpolation into a remote
/// shell string. This is the only escape hatch through which
/// deny-set characters may travel.
pub fn quote(value: &str) -> String {
  escape(Cow::Borrowed(value)).into_owned()
}

/// Assert a value is clean of shell metacharacters without
/// quoting it. For values that end up in argv positions where
/// quoting would change meaning (flags, subcommands).
pub fn reject_metacharacters<'a>(
  field: &'static str,
  value: &'a str,
) -> Result<&'a str> {
  match find_denied_char(value) {
    Some(_) => Err(InvalidInput::new(field, value)),
    None => Ok(value),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn quoting_wraps_and_escapes() {
    assert_eq!(quote("plain"), "plain");
    assert_eq!(quote("has space"), "'has space'");
    // The end-quote / backslash-quote / reopen idiom.
    assert_eq!(quote("it's"), r"'it'\''s'");
    assert_eq!(quote("$(evil)"), "'$(evil)'");
  }

  #[test]
  fn unquoted_values_fail_closed() {
    assert!(reject_metacharacters("arg", "safe-value").is_ok());
    for value in ["a;b", "a|b", "a`b", "a$b", "a>b", "a~"] {
      assert!(
        reject_metacharacters("arg", value).is_err(),
        "{value}"
      );
    }
  }
}
