use serde::{Deserialize, Serialize};

/// Capability that grants chat access regardless of role.
pub const CHAT_CAPABILITY: &str = "use_chat_assistant";

pub const REASON_LOGIN: &str = "You must be logged in to use the chatbot.";
pub const REASON_DISABLED: &str = "The chatbot is currently disabled.";
pub const REASON_PAGE: &str = "The chatbot is not available on this page.";
pub const REASON_PERMISSION: &str = "You do not have permission to use the chatbot.";

/// Identity of a logged-in actor as supplied by the host application.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: u64,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Actor {
    fn matches_entry(&self, entry: &str) -> bool {
        let entry = entry.trim();
        if entry.is_empty() {
            return false;
        }
        (!self.email.is_empty() && self.email.eq_ignore_ascii_case(entry))
            || (!self.login.is_empty() && self.login == entry)
            || entry.parse::<u64>().map(|id| id == self.id).unwrap_or(false)
    }

    fn listed_in(&self, list: &[String]) -> bool {
        list.iter().any(|entry| self.matches_entry(entry))
    }
}

/// The page the chat widget is rendered on.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    #[serde(default)]
    pub page_id: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub is_front_page: bool,
    /// The posts listing page.
    #[serde(default)]
    pub is_blog_listing: bool,
    /// Category, tag, author and date archives.
    #[serde(default)]
    pub is_archive: bool,
    #[serde(default)]
    pub is_search: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    All,
    /// Only on the selected pages.
    Selected,
    /// Everywhere except the selected pages.
    Exclude,
}

/// One entry of the selected-pages list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "RawSelector", into = "RawSelector")]
pub enum PageSelector {
    Page(u64),
    Home,
    Blog,
    Archive,
    Search,
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum RawSelector {
    Id(u64),
    Name(String),
}

impl TryFrom<RawSelector> for PageSelector {
    type Error = String;

    fn try_from(raw: RawSelector) -> Result<Self, Self::Error> {
        match raw {
            RawSelector::Id(id) => Ok(PageSelector::Page(id)),
            RawSelector::Name(name) => name.parse(),
        }
    }
}

impl From<PageSelector> for RawSelector {
    fn from(sel: PageSelector) -> Self {
        match sel {
            PageSelector::Page(id) => RawSelector::Id(id),
            PageSelector::Home => RawSelector::Name("home".into()),
            PageSelector::Blog => RawSelector::Name("blog".into()),
            PageSelector::Archive => RawSelector::Name("archive".into()),
            PageSelector::Search => RawSelector::Name("search".into()),
        }
    }
}

impl std::str::FromStr for PageSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "home" => Ok(PageSelector::Home),
            "blog" => Ok(PageSelector::Blog),
            "archive" => Ok(PageSelector::Archive),
            "search" => Ok(PageSelector::Search),
            _ => s
                .parse::<u64>()
                .map(PageSelector::Page)
                .map_err(|_| format!("unknown page selector '{}'", s)),
        }
    }
}

impl PageSelector {
    fn matches(&self, page: &PageContext) -> bool {
        match self {
            PageSelector::Page(id) => page.page_id == Some(*id) && *id != 0,
            PageSelector::Home => page.is_front_page || page.is_blog_listing,
            PageSelector::Blog => page.is_blog_listing && !page.is_front_page,
            PageSelector::Archive => page.is_archive,
            PageSelector::Search => page.is_search,
        }
    }
}

/// Access configuration, resolved once at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessPolicy {
    pub enabled: bool,
    pub require_login: bool,
    pub display_mode: DisplayMode,
    pub selected_pages: Vec<PageSelector>,
    pub allowed_roles: Vec<String>,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            require_login: true,
            display_mode: DisplayMode::All,
            selected_pages: Vec::new(),
            allowed_roles: vec!["administrator".to_string(), "editor".to_string()],
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AccessDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Decides whether an actor may use the chat on a page.  Pure function of
/// the policy and the supplied identity.
#[derive(Debug, Clone)]
pub struct AccessEvaluator {
    policy: AccessPolicy,
}

impl AccessEvaluator {
    pub fn new(policy: AccessPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Display-policy check.  `None` means the call is not tied to a page
    /// render (an API call from an already-rendered widget) and is eligible.
    pub fn should_display(&self, page: Option<&PageContext>) -> bool {
        let Some(page) = page else {
            return true;
        };
        let selected = self.policy.selected_pages.iter().any(|s| s.matches(page));
        match self.policy.display_mode {
            DisplayMode::All => true,
            DisplayMode::Selected => selected,
            DisplayMode::Exclude => !selected,
        }
    }

    fn actor_permitted(&self, actor: &Actor) -> bool {
        if actor.listed_in(&self.policy.blacklist) {
            return false;
        }
        if !self.policy.whitelist.is_empty() {
            return actor.listed_in(&self.policy.whitelist);
        }
        let by_role = actor
            .roles
            .iter()
            .any(|role| self.policy.allowed_roles.iter().any(|r| r == role));
        by_role || actor.capabilities.iter().any(|c| c == CHAT_CAPABILITY)
    }

    pub fn check_access(&self, actor: Option<&Actor>, page: Option<&PageContext>) -> AccessDecision {
        if self.policy.require_login && actor.is_none() {
            return AccessDecision::deny(REASON_LOGIN);
        }
        if !self.policy.enabled {
            return AccessDecision::deny(REASON_DISABLED);
        }
        if !self.should_display(page) {
            return AccessDecision::deny(REASON_PAGE);
        }
        match actor {
            Some(actor) if !self.actor_permitted(actor) => {
                AccessDecision::deny(REASON_PERMISSION)
            }
            _ => AccessDecision::allow(),
        }
    }
}
