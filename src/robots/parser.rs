//! Robots.txt rule evaluation
//!
//! Allow/disallow matching is delegated to the robotstxt crate. Crawl-delay is
//! not part of that matcher, so it is read from the grouped directives here.

use robotstxt::DefaultMatcher;

/// Robots.txt rules for one host
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    /// Raw robots.txt content (empty means allow all)
    content: String,
}

impl RobotsRules {
    /// Creates rules from raw robots.txt content
    pub fn from_content(content: &str) -> Self {
        Self {
            content: content.to_string(),
        }
    }

    /// Rules that allow everything
    ///
    /// Used when robots.txt is missing (4xx) or cannot be fetched.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_allow_all(&self) -> bool {
        self.content.trim().is_empty()
    }

    /// Checks if a URL is allowed for the given user agent token
    ///
    /// # Arguments
    ///
    /// * `url` - Absolute URL or path to check
    /// * `agent` - The crawler's product token (e.g. `SeoAuditor`)
    pub fn is_allowed(&self, url: &str, agent: &str) -> bool {
        if self.is_allow_all() {
            return true;
        }

        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.content, agent, url)
    }

    /// Gets the crawl delay in seconds for the given agent token
    ///
    /// A group naming the agent wins over the `*` group. A group starts at a
    /// `User-agent` line that follows any other directive.
    pub fn crawl_delay(&self, agent: &str) -> Option<f64> {
        if self.is_allow_all() {
            return None;
        }

        let agent = agent.to_lowercase();
        let mut group_agents: Vec<String> = Vec::new();
        let mut in_agent_lines = false;
        let mut wildcard_delay = None;
        let mut agent_delay = None;

        for line in self.content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            if key == "user-agent" {
                if !in_agent_lines {
                    group_agents.clear();
                }
                group_agents.push(value.to_lowercase());
                in_agent_lines = true;
                continue;
            }
            in_agent_lines = false;

            if key != "crawl-delay" {
                continue;
            }
            let Ok(delay) = value.parse::<f64>() else {
                continue;
            };
            if delay < 0.0 || !delay.is_finite() {
                continue;
            }

            if group_agents.iter().any(|ua| ua != "*" && agent.contains(ua.as_str())) {
                agent_delay = Some(delay);
            } else if group_agents.iter().any(|ua| ua == "*") {
                wildcard_delay = wildcard_delay.or(Some(delay));
            }
        }

        agent_delay.or(wildcard_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let robots = RobotsRules::allow_all();
        assert!(robots.is_allowed("https://ex.com/admin", "TestBot"));
    }

    #[test]
    fn test_disallow_specific_path() {
        let robots = RobotsRules::from_content("User-agent: *\nDisallow: /admin");
        assert!(robots.is_allowed("https://ex.com/", "TestBot"));
        assert!(!robots.is_allowed("https://ex.com/admin", "TestBot"));
        assert!(!robots.is_allowed("https://ex.com/admin/users", "TestBot"));
    }

    #[test]
    fn test_allow_overrides_disallow() {
        let robots =
            RobotsRules::from_content("User-agent: *\nDisallow: /private\nAllow: /private/public");
        assert!(!robots.is_allowed("https://ex.com/private", "TestBot"));
        assert!(robots.is_allowed("https://ex.com/private/public", "TestBot"));
    }

    #[test]
    fn test_specific_user_agent() {
        let robots =
            RobotsRules::from_content("User-agent: BadBot\nDisallow: /\n\nUser-agent: *\nAllow: /");
        assert!(robots.is_allowed("https://ex.com/page", "GoodBot"));
        assert!(!robots.is_allowed("https://ex.com/page", "BadBot"));
    }

    #[test]
    fn test_garbage_allows() {
        let robots = RobotsRules::from_content("This is not valid robots.txt {{{");
        assert!(robots.is_allowed("https://ex.com/any", "TestBot"));
    }

    #[test]
    fn test_crawl_delay_wildcard() {
        let robots = RobotsRules::from_content("User-agent: *\nDisallow: /admin\nCrawl-delay: 10");
        assert_eq!(robots.crawl_delay("TestBot"), Some(10.0));
    }

    #[test]
    fn test_crawl_delay_agent_beats_wildcard() {
        let robots = RobotsRules::from_content(
            "User-agent: *\nCrawl-delay: 10\n\nUser-agent: TestBot\nCrawl-delay: 2.5",
        );
        assert_eq!(robots.crawl_delay("TestBot"), Some(2.5));
        assert_eq!(robots.crawl_delay("OtherBot"), Some(10.0));
    }

    #[test]
    fn test_crawl_delay_groups_do_not_leak() {
        let robots = RobotsRules::from_content(
            "User-agent: BotA\nDisallow: /x\nUser-agent: BotB\nCrawl-delay: 3",
        );
        assert_eq!(robots.crawl_delay("BotB"), Some(3.0));
        assert_eq!(robots.crawl_delay("BotA"), None);
    }

    #[test]
    fn test_crawl_delay_multiple_agents_in_group() {
        let robots = RobotsRules::from_content("User-agent: BotA\nUser-agent: BotB\nCrawl-delay: 3");
        assert_eq!(robots.crawl_delay("BotA"), Some(3.0));
        assert_eq!(robots.crawl_delay("BotB"), Some(3.0));
        assert_eq!(robots.crawl_delay("BotC"), None);
    }

    #[test]
    fn test_crawl_delay_ignores_invalid() {
        let robots = RobotsRules::from_content("User-agent: *\nCrawl-delay: soon");
        assert_eq!(robots.crawl_delay("TestBot"), None);
    }
}
