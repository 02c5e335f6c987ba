//! Channel key definitions

/// Channel key patterns
pub struct Topics;

impl Topics {
    /// Build log channel for one deployment of one project
    pub fn logs(deployment_id: &str, project_id: &str) -> String {
        format!("logs:{}:{}", deployment_id, project_id)
    }

    /// Status channel for one deployment
    pub fn status(deployment_id: &str) -> String {
        format!("status:{}", deployment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        assert_eq!(Topics::logs("d1", "p1"), "logs:d1:p1");
        assert_eq!(Topics::status("d1"), "status:d1");
    }
}
