use rand::distr::Alphanumeric;
use rand::{rng, Rng};

/// Length of the generated passwords
pub const PASSWORD_LENGTH: usize = 18;
/// Length of the random suffix appended to generated user names
pub const USER_SUFFIX_LENGTH: usize = 5;

/// Returns a random alphanumeric string of length `len`
#[inline]
#[must_use]
pub fn random_alphanumeric(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Returns a new random password
#[inline]
#[must_use]
pub fn random_password() -> String {
    random_alphanumeric(PASSWORD_LENGTH)
}

/// Returns a user name starting with `prefix`, e.g. `repl_a8Xz2`
#[inline]
#[must_use]
pub fn random_user(prefix: &str) -> String {
    format!("{prefix}{}", random_alphanumeric(USER_SUFFIX_LENGTH))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn password_has_expected_shape() {
        let pass = random_password();
        assert_eq!(pass.len(), PASSWORD_LENGTH);
        assert!(pass.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(pass, random_password(), "two passwords should differ");
    }

    #[test]
    fn user_keeps_prefix() {
        let user = random_user("repl_");
        assert!(user.starts_with("repl_"));
        assert_eq!(user.len(), "repl_".len() + USER_SUFFIX_LENGTH);
    }
}
