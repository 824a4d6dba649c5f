use std::fmt;

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Init,
    ConnectServer,
    ReadHandshake,
    SendHandshake,
    ReadAuth,
    SendAuth,
    ReadAuthResult,
    SendAuthResult,
    ReadAuthOldPassword,
    SendAuthOldPassword,
    ReadQuery,
    SendQuery,
    ReadQueryResult,
    SendQueryResult,
    CloseClient,
    SendError,
    Error,
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Init => "init",
            ConnectionState::ConnectServer => "connect_server",
            ConnectionState::ReadHandshake => "read_handshake",
            ConnectionState::SendHandshake => "send_handshake",
            ConnectionState::ReadAuth => "read_auth",
            ConnectionState::SendAuth => "send_auth",
            ConnectionState::ReadAuthResult => "read_auth_result",
            ConnectionState::SendAuthResult => "send_auth_result",
            ConnectionState::ReadAuthOldPassword => "read_auth_old_password",
            ConnectionState::SendAuthOldPassword => "send_auth_old_password",
            ConnectionState::ReadQuery => "read_query",
            ConnectionState::SendQuery => "send_query",
            ConnectionState::ReadQueryResult => "read_query_result",
            ConnectionState::SendQueryResult => "send_query_result",
            ConnectionState::CloseClient => "close_client",
            ConnectionState::SendError => "send_error",
            ConnectionState::Error => "error",
        }
    }

    /// States that end the connection
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::CloseClient | ConnectionState::SendError | ConnectionState::Error
        )
    }

    /// Whether `next` may follow `self`.
    ///
    /// Any live state may move to a terminal one.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if !self.is_terminal() && next.is_terminal() {
            return true;
        }

        matches!(
            (self, next),
            (Init, ConnectServer)
                | (ConnectServer, ReadHandshake | SendHandshake)
                | (ReadHandshake, SendHandshake)
                | (SendHandshake, ReadAuth)
                | (ReadAuth, SendAuth | SendAuthResult)
                | (SendAuth, ReadAuthResult)
                | (ReadAuthResult, SendAuthResult)
                | (SendAuthResult, ReadQuery | ReadAuthOldPassword | ReadAuthResult)
                | (ReadAuthOldPassword, SendAuthOldPassword)
                | (SendAuthOldPassword, ReadAuthResult)
                | (ReadQuery, SendQuery | SendQueryResult)
                | (SendQuery, ReadQueryResult | ReadQuery | SendQuery)
                | (ReadQueryResult, SendQueryResult)
                | (SendQueryResult, ReadQueryResult | ReadQuery | SendQuery)
                | (SendError, Error)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            Init,
            ConnectServer,
            ReadHandshake,
            SendHandshake,
            ReadAuth,
            SendAuth,
            ReadAuthResult,
            SendAuthResult,
            ReadQuery,
            SendQuery,
            ReadQueryResult,
            SendQueryResult,
            ReadQuery,
            CloseClient,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_pooled_and_old_password_paths() {
        assert!(ConnectServer.can_transition_to(SendHandshake));
        assert!(ReadAuth.can_transition_to(SendAuthResult));
        assert!(SendAuthResult.can_transition_to(ReadAuthOldPassword));
        assert!(ReadAuthOldPassword.can_transition_to(SendAuthOldPassword));
        assert!(SendAuthOldPassword.can_transition_to(ReadAuthResult));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Init.can_transition_to(ReadQuery));
        assert!(!ReadQuery.can_transition_to(ReadAuth));
        assert!(!Error.can_transition_to(ReadQuery));
        assert!(!CloseClient.can_transition_to(SendError));
        assert!(SendError.can_transition_to(Error));
    }

    #[test]
    fn test_any_live_state_can_fail() {
        for state in [Init, ReadHandshake, SendAuth, ReadQueryResult] {
            assert!(state.can_transition_to(SendError));
            assert!(state.can_transition_to(Error));
            assert!(state.can_transition_to(CloseClient));
        }
    }
}
