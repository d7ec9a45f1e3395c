//! Push notifications and what clicking them does.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use url::Url;

use crate::config::NotificationConfig;

/// Action token for opening the site from a notification.
pub const ACTION_EXPLORE: &str = "explore";
/// Action token that only dismisses the notification.
pub const ACTION_CLOSE: &str = "close";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
  /// Milliseconds since the epoch
  pub date_of_arrival: i64,
  pub primary_key: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

impl Notification {
  /// Build the notification for a push; no payload (or an empty one) means
  /// the default body.
  pub fn from_push(payload: Option<&str>, config: &NotificationConfig) -> Self {
    let body = match payload {
      Some(text) if !text.is_empty() => text.to_string(),
      _ => config.default_body.clone(),
    };

    Self {
      title: config.title.clone(),
      body,
      icon: config.icon.clone(),
      badge: config.badge.clone(),
      vibrate: config.vibrate.clone(),
      data: NotificationData {
        date_of_arrival: chrono::Utc::now().timestamp_millis(),
        primary_key: 1,
      },
      actions: vec![
        NotificationAction {
          action: ACTION_EXPLORE.to_string(),
          title: "View Details".to_string(),
          icon: "/assets/images/checkmark.png".to_string(),
        },
        NotificationAction {
          action: ACTION_CLOSE.to_string(),
          title: "Close".to_string(),
          icon: "/assets/images/xmark.png".to_string(),
        },
      ],
    }
  }
}

/// What the host should do after a notification click. The notification
/// itself is always dismissed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// Open the URL in a new window, or focus a window already showing it
  OpenOrFocus(Url),
  Dismiss,
}

/// Resolve a click on `action` (None for a click on the notification body).
pub fn handle_click(
  action: Option<&str>,
  config: &NotificationConfig,
  origin: &Url,
) -> Result<ClickOutcome> {
  match action {
    Some(ACTION_EXPLORE) => {
      let root = origin
        .join(&config.root_url)
        .map_err(|e| eyre!("Invalid notification root url '{}': {}", config.root_url, e))?;
      Ok(ClickOutcome::OpenOrFocus(root))
    }
    Some(ACTION_CLOSE) | None => Ok(ClickOutcome::Dismiss),
    Some(other) => {
      tracing::debug!(action = other, "Unknown notification action, dismissing");
      Ok(ClickOutcome::Dismiss)
    }
  }
}
