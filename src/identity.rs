use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Standard,
    Elevated,
}

impl Role {
    /// Maps the `role` column of a profile row. Only "admin" is elevated.
    pub fn from_profile_role(role: Option<&str>) -> Self {
        match role {
            Some("admin") => Role::Elevated,
            _ => Role::Standard,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

/// Session changes reported by the authentication collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session started. The role is standard until the profile loads.
    SignedIn { user_id: String },
    ProfileLoaded { role: Role },
    SignedOut,
}

/// The signed-in user, shared by every view constructed with it. Updated
/// only through session events.
#[derive(Clone, Default)]
pub struct IdentityContext {
    current: Arc<RwLock<Option<Identity>>>,
}

impl IdentityContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: &str, role: Role) -> Self {
        let context = Self::default();
        context.apply(&SessionEvent::SignedIn { user_id: user_id.to_string() });
        context.apply(&SessionEvent::ProfileLoaded { role });
        context
    }

    pub fn apply(&self, event: &SessionEvent) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            SessionEvent::SignedIn { user_id } => {
                log::info!("session started for {}", user_id);
                *current = Some(Identity { user_id: user_id.clone(), role: Role::Standard });
            }
            SessionEvent::ProfileLoaded { role } => match current.as_mut() {
                Some(identity) => identity.role = *role,
                None => log::warn!("profile loaded without a session, ignoring"),
            },
            SessionEvent::SignedOut => {
                log::info!("session ended");
                *current = None;
            }
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.current().map(|identity| identity.user_id)
    }

    pub fn has_elevated_role(&self) -> bool {
        self.current().is_some_and(|identity| identity.role == Role::Elevated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lifecycle() {
        let context = IdentityContext::anonymous();
        assert_eq!(context.current_user_id(), None);
        assert!(!context.has_elevated_role());

        context.apply(&SessionEvent::SignedIn { user_id: "u1".to_string() });
        assert_eq!(context.current_user_id().as_deref(), Some("u1"));
        assert!(!context.has_elevated_role());

        context.apply(&SessionEvent::ProfileLoaded { role: Role::from_profile_role(Some("admin")) });
        assert!(context.has_elevated_role());

        context.apply(&SessionEvent::SignedOut);
        assert_eq!(context.current(), None);
    }

    #[test]
    fn clones_follow_the_same_session() {
        let context = IdentityContext::signed_in("u1", Role::Elevated);
        let held_by_view = context.clone();
        context.apply(&SessionEvent::SignedOut);
        assert!(!held_by_view.has_elevated_role());
    }

    #[test]
    fn profile_without_session_is_ignored() {
        let context = IdentityContext::anonymous();
        context.apply(&SessionEvent::ProfileLoaded { role: Role::Elevated });
        assert_eq!(context.current(), None);
    }

    #[test]
    fn only_admin_is_elevated() {
        assert_eq!(Role::from_profile_role(Some("admin")), Role::Elevated);
        assert_eq!(Role::from_profile_role(Some("user")), Role::Standard);
        assert_eq!(Role::from_profile_role(None), Role::Standard);
    }
}
