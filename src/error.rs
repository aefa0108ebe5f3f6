use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Auth,
    Validation,
    OAuth,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Network => "network",
            ErrorKind::Auth => "auth",
            ErrorKind::Validation => "validation",
            ErrorKind::OAuth => "oauth",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not signed in")]
    Unauthenticated,
    #[error("request failed: {0}")]
    Transport(String),
    #[error("{message} (status {status})")]
    Status { status: u16, message: String },
    #[error("decode response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Unauthenticated => ErrorKind::Auth,
            ApiError::Status { status: 401, .. } | ApiError::Status { status: 403, .. } => {
                ErrorKind::Auth
            }
            _ => ErrorKind::Network,
        }
    }
}

pub fn classify(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(api) = cause.downcast_ref::<ApiError>() {
            return api.kind();
        }
        if cause.downcast_ref::<crate::session::SessionError>().is_some() {
            return ErrorKind::Auth;
        }
        if cause.downcast_ref::<crate::upload::UploadError>().is_some() {
            return ErrorKind::Validation;
        }
        if cause.downcast_ref::<crate::oauth::OAuthError>().is_some() {
            return ErrorKind::OAuth;
        }
    }
    ErrorKind::Network
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn status_codes_map_to_kinds() {
        let unauthorized = ApiError::Status {
            status: 401,
            message: "expired".into(),
        };
        assert_eq!(unauthorized.kind(), ErrorKind::Auth);
        let server = ApiError::Status {
            status: 502,
            message: "bad gateway".into(),
        };
        assert_eq!(server.kind(), ErrorKind::Network);
        assert_eq!(server.to_string(), "bad gateway (status 502)");
    }

    #[test]
    fn classify_walks_context_chain() {
        let err = Err::<(), _>(ApiError::Unauthenticated)
            .context("content: load scheduled")
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Auth);
        assert_eq!(classify(&anyhow::anyhow!("boom")), ErrorKind::Network);
        let expired = anyhow::Error::new(crate::session::SessionError::Expired);
        assert_eq!(classify(&expired), ErrorKind::Auth);
    }
}
