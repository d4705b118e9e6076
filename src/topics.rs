//! Session-scoped topic names.

/// Topic the host publishes game events on.
pub fn session_topic(session_id: &str) -> String {
    format!("publish/question/session/{session_id}")
}

/// Topic viewers publish comments on.
pub fn comment_topic(session_id: &str) -> String {
    format!("publish/comment/{session_id}")
}

/// Topic viewers publish answers on.
pub fn answer_topic(session_id: &str) -> String {
    format!("answer/question/session/{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names() {
        assert_eq!(session_topic("17"), "publish/question/session/17");
        assert_eq!(comment_topic("17"), "publish/comment/17");
        assert_eq!(answer_topic("17"), "answer/question/session/17");
    }
}
