use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTriple {
    pub api_version: String,
    pub model: String,
    pub action: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Route {
    Matched(RouteTriple),
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    GenerateContent,
    StreamGenerateContent,
    GenerateAnswer,
}

impl Action {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "generateContent" => Some(Action::GenerateContent),
            "streamGenerateContent" => Some(Action::StreamGenerateContent),
            "generateAnswer" => Some(Action::GenerateAnswer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::GenerateContent => "generateContent",
            Action::StreamGenerateContent => "streamGenerateContent",
            Action::GenerateAnswer => "generateAnswer",
        }
    }

    pub fn target_endpoint(&self) -> &'static str {
        match self {
            Action::GenerateContent | Action::StreamGenerateContent | Action::GenerateAnswer => {
                "chat/completions"
            }
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Action::StreamGenerateContent)
    }
}

fn target_api_version(api_version: &str) -> Option<&'static str> {
    match api_version {
        "v1beta" => Some("v1"),
        "v1" => Some("v1"),
        _ => None,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("unsupported api version: {0}")]
    UnsupportedVersion(String),
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub model: String,
    pub action: Action,
    pub upstream_path: String,
}

/// Routes on the percent-decoded path; an undecodable path is matched as sent.
pub fn parse_request_path(raw: &str) -> Route {
    match urlencoding::decode(raw) {
        Ok(decoded) => parse_path(&decoded),
        Err(_) => parse_path(raw),
    }
}

pub fn parse_path(path: &str) -> Route {
    let mut segments = path.rsplitn(4, '/');
    let (Some(last), Some(models), Some(api_version), Some(_)) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Route::Passthrough;
    };
    if models != "models" || api_version.is_empty() {
        return Route::Passthrough;
    }
    let Some((model, action)) = last.rsplit_once(':') else {
        return Route::Passthrough;
    };
    if model.is_empty() || action.is_empty() {
        return Route::Passthrough;
    }
    Route::Matched(RouteTriple {
        api_version: api_version.to_string(),
        model: model.to_string(),
        action: action.to_string(),
    })
}

impl RouteTriple {
    pub fn resolve(&self) -> Result<ResolvedRoute, RouteError> {
        let version = target_api_version(&self.api_version)
            .ok_or_else(|| RouteError::UnsupportedVersion(self.api_version.clone()))?;
        let action = Action::parse(&self.action)
            .ok_or_else(|| RouteError::UnsupportedAction(self.action.clone()))?;
        Ok(ResolvedRoute {
            model: self.model.clone(),
            action,
            upstream_path: format!("/{}/{}", version, action.target_endpoint()),
        })
    }
}
