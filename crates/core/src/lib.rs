pub mod backend;
pub mod connection_tree;
pub mod dispatcher;
pub mod loading;
pub mod profiles;
pub mod query_templates;
pub mod results;
pub mod session;
pub mod settings;
pub mod storage;
pub mod structured_query;
pub mod workspace;

#[must_use]
pub fn domain_name() -> &'static str {
    "dbdeck-core"
}

#[cfg(test)]
mod tests {
    use super::domain_name;

    #[test]
    fn domain_name_is_stable() {
        assert_eq!(domain_name(), "dbdeck-core");
    }
}
