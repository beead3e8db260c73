use std::fmt;
use std::str::FromStr;

// ============================================================================
// Queue Topics
// ============================================================================
//
// Queue names are shared with the producing services and must match them
// byte for byte. Each consumer service owns its own queue per event, which is
// why the same event appears under several prefixes.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    // Seller dashboard replicas
    DashboardUserCreated,
    DashboardProductCreated,
    DashboardOrderCreated,
    DashboardPaymentCreated,
    DashboardPaymentInitiated,
    DashboardPaymentCompleted,
    DashboardPaymentFailed,

    // Notification emails
    NotificationUserCreated,
    NotificationPaymentInitiated,
    NotificationPaymentCompleted,
    NotificationPaymentFailed,
}

impl Topic {
    pub const SELLER_DASHBOARD: [Topic; 7] = [
        Topic::DashboardUserCreated,
        Topic::DashboardProductCreated,
        Topic::DashboardOrderCreated,
        Topic::DashboardPaymentCreated,
        Topic::DashboardPaymentInitiated,
        Topic::DashboardPaymentCompleted,
        Topic::DashboardPaymentFailed,
    ];

    pub const NOTIFICATION: [Topic; 4] = [
        Topic::NotificationUserCreated,
        Topic::NotificationPaymentInitiated,
        Topic::NotificationPaymentCompleted,
        Topic::NotificationPaymentFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::DashboardUserCreated => "AUTH_SELLER_DASHBOARD.USER_CREATED",
            Topic::DashboardProductCreated => "PRODUCTS_SELLER_DASHBOARD.PRODUCT_CREATED",
            Topic::DashboardOrderCreated => "ORDER_SELLER_DASHBOARD.ORDER_CREATED",
            Topic::DashboardPaymentCreated => "PAYMENT_SELLER_DASHBOARD.PAYMENT_CREATED",
            Topic::DashboardPaymentInitiated => "PAYMENT_SELLER_DASHBOARD.PAYMENT_INITIATED",
            Topic::DashboardPaymentCompleted => "PAYMENT_SELLER_DASHBOARD.PAYMENT_COMPLETED",
            Topic::DashboardPaymentFailed => "PAYMENT_SELLER_DASHBOARD.PAYMENT_FAILED",
            Topic::NotificationUserCreated => "AUTH_NOTIFICATION_USER_CREATED",
            Topic::NotificationPaymentInitiated => "PAYMENT_NOTIFICATION.PAYMENT_INITIATED",
            Topic::NotificationPaymentCompleted => "PAYMENT_NOTIFICATION.PAYMENT_COMPLETED",
            Topic::NotificationPaymentFailed => "PAYMENT_NOTIFICATION.PAYMENT_FAILED",
        }
    }

    pub fn all() -> impl Iterator<Item = Topic> {
        Self::SELLER_DASHBOARD.into_iter().chain(Self::NOTIFICATION)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown topic: {0}")]
pub struct UnknownTopic(pub String);

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::all()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names_round_trip() {
        for topic in Topic::all() {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
        assert_eq!(Topic::all().count(), 11);
    }

    #[test]
    fn test_unknown_topic_is_rejected() {
        let err = "ORDER_CREATED".parse::<Topic>().unwrap_err();
        assert_eq!(err, UnknownTopic("ORDER_CREATED".to_string()));
    }
}
