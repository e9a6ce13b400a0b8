use crate::error::BountyError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Report lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Accepted,
    Rejected,
    Completed,
}

impl ReportStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
        }
    }

    /// True once a decision (or archival) has been recorded.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn can_transition_to(self, next: ReportStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Accepted)
                | (Self::Pending, Self::Rejected)
                | (Self::Accepted, Self::Completed)
                | (Self::Rejected, Self::Completed)
        )
    }

    /// Validate `self -> next`, returning the next status.
    pub fn transition(self, next: ReportStatus) -> Result<ReportStatus, BountyError> {
        if !self.can_transition_to(next) {
            return Err(BountyError::illegal_transition(self.name(), next.name()));
        }
        Ok(next)
    }
}

impl FromStr for ReportStatus {
    type Err = BountyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "completed" => Ok(Self::Completed),
            other => Err(BountyError::Validation(format!(
                "unknown report status '{other}'"
            ))),
        }
    }
}

/// Whether a report was sent by this node or received by one of its inboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }
}

impl FromStr for Direction {
    type Err = BountyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sent" => Ok(Self::Sent),
            "received" => Ok(Self::Received),
            other => Err(BountyError::Validation(format!(
                "unknown report direction '{other}'"
            ))),
        }
    }
}

/// Reply type carried by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Accepted,
    Rejected,
    Acknowledged,
}

impl ResponseType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Acknowledged => "acknowledged",
        }
    }

    /// Status a report moves to when this response is applied, if any.
    pub fn target_status(self) -> Option<ReportStatus> {
        match self {
            Self::Accepted => Some(ReportStatus::Accepted),
            Self::Rejected => Some(ReportStatus::Rejected),
            Self::Acknowledged => None,
        }
    }
}

impl FromStr for ResponseType {
    type Err = BountyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "acknowledged" => Ok(Self::Acknowledged),
            other => Err(BountyError::Validation(format!(
                "unknown response type '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ReportStatus; 4] = [
        ReportStatus::Pending,
        ReportStatus::Accepted,
        ReportStatus::Rejected,
        ReportStatus::Completed,
    ];

    #[test]
    fn only_documented_transitions_are_legal() {
        let legal = [
            (ReportStatus::Pending, ReportStatus::Accepted),
            (ReportStatus::Pending, ReportStatus::Rejected),
            (ReportStatus::Accepted, ReportStatus::Completed),
            (ReportStatus::Rejected, ReportStatus::Completed),
        ];

        for from in ALL {
            for to in ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(from.transition(to).is_ok(), expected, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn illegal_transition_names_both_states() {
        let err = ReportStatus::Accepted
            .transition(ReportStatus::Rejected)
            .unwrap_err();
        assert!(err.to_string().contains("accepted -> rejected"));
    }

    #[test]
    fn status_names_parse_back() {
        for status in ALL {
            assert_eq!(status.name().parse::<ReportStatus>().unwrap(), status);
        }
        assert!("archived".parse::<ReportStatus>().is_err());
    }
}
