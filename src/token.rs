use mio::Token;

/// The listening socket.
pub const LISTENER: Token = Token(0);
/// On a secondary, the outbound connection to the primary.
pub const UPSTREAM: Token = Token(1);

/// Connections promoted to replicas after PSYNC get tokens from this range.
pub const FIRST_REPLICA_TOKEN: Token = Token(2);
/// Everything at or above this is an ordinary client connection.
pub const FIRST_CLIENT_TOKEN: Token = Token(64);

pub fn is_replica_token(token: Token) -> bool {
    token.0 >= FIRST_REPLICA_TOKEN.0 && token.0 < FIRST_CLIENT_TOKEN.0
}

/// Hands out fresh tokens for the two dynamic ranges.
#[derive(Debug, Clone)]
pub struct TokenAllocator {
    next_client: Token,
    next_replica: Token,
}

impl TokenAllocator {
    pub fn new() -> Self {
        Self {
            next_client: FIRST_CLIENT_TOKEN,
            next_replica: FIRST_REPLICA_TOKEN,
        }
    }

    pub fn next_client_token(&mut self) -> Token {
        let token = self.next_client;
        self.next_client = Token(token.0 + 1);
        token
    }

    pub fn next_replica_token(&mut self) -> Token {
        let token = self.next_replica;
        assert!(
            token.0 < FIRST_CLIENT_TOKEN.0,
            "replica token range exhausted"
        );
        self.next_replica = Token(token.0 + 1);
        token
    }
}

impl Default for TokenAllocator {
    fn default() -> Self {
        Self::new()
    }
}
