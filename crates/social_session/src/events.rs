use crate::models::UserProfile;

/// State transitions published by [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A persisted token was restored at startup
    Restored,
    LoggedIn { username: String },
    /// `authenticated` is false when the token is pending onboarding
    Registered { authenticated: bool },
    OnboardingFinished,
    OnboardingAbandoned,
    ProfileImageUploaded { url: String },
    ProfileRefreshed(UserProfile),
    ProfileRefreshFailed { reason: String },
    LoggedOut,
}
