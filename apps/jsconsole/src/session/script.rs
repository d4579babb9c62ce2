use rand::Rng;
use rand::distributions::Alphanumeric;

const TOKEN_LEN: usize = 10;

/// The session's one "editable" script.
///
/// The debug agent has no way to replace a script's source, so every
/// evaluation runs under a fresh document name. `generation` counts how many
/// times the name has been replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualScript {
    session_name: String,
    suffix: &'static str,
    generation: u64,
    token: String,
}

impl VirtualScript {
    pub fn new(session_name: impl Into<String>, suffix: &'static str) -> Self {
        Self {
            session_name: session_name.into(),
            suffix,
            generation: 0,
            token: random_token(),
        }
    }

    /// Name the engine compiles the code under: `<session>_<token>.js`.
    pub fn document_name(&self) -> String {
        format!("{}_{}.js", self.session_name, self.token)
    }

    /// Script name as the debug agent reports it; what breakpoints target.
    pub fn target(&self) -> String {
        format!("{}{}", self.document_name(), self.suffix)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn regenerate(&mut self) {
        let previous = std::mem::replace(&mut self.token, random_token());
        // Ten alphanumerics collide rarely; never reuse the name just retired.
        while self.token == previous {
            self.token = random_token();
        }
        self.generation += 1;
    }
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_template() {
        let script = VirtualScript::new("console", " [temp]");
        let document = script.document_name();
        let token = document
            .strip_prefix("console_")
            .and_then(|rest| rest.strip_suffix(".js"))
            .expect("template");
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(script.target(), format!("{document} [temp]"));
    }

    #[test]
    fn regenerate_changes_name_and_counts() {
        let mut script = VirtualScript::new("s", "");
        let first = script.target();
        script.regenerate();
        script.regenerate();
        assert_ne!(script.target(), first);
        assert_eq!(script.generation(), 2);
        assert!(script.target().starts_with("s_"));
    }
}
