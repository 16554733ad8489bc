//! Cluster membership configuration.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::Error;
use crate::ServerId;

/// Version tag of the binary configuration encoding.
const ENCODING_VERSION: u8 = 1;

/// One server in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Server {
    pub id: ServerId,

    /// Opaque network address, interpreted only by the transport.
    pub address: String,

    /// Whether this server's vote counts toward quorum. Non-voters receive
    /// replication but do not vote and are not counted in majorities.
    pub voting: bool,
}

/// An ordered list of servers with no duplicate ids.
///
/// The initial configuration is installed by bootstrap as the first log
/// entry; afterwards it changes only by applying a configuration entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Configuration {
    servers: Vec<Server>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Add a server. Rejects id `0` and duplicate ids.
    pub fn add(&mut self, id: ServerId, address: impl Into<String>, voting: bool) -> Result<(), Error> {
        if id == 0 {
            return Err(Error::BadConfig("server id must not be 0".to_string()));
        }
        if self.get(id).is_some() {
            return Err(Error::BadConfig(format!("duplicate server id {}", id)));
        }
        self.servers.push(Server {
            id,
            address: address.into(),
            voting,
        });
        Ok(())
    }

    /// Remove the server with the given id.
    pub fn remove(&mut self, id: ServerId) -> Result<(), Error> {
        match self.index_of(id) {
            Some(i) => {
                self.servers.remove(i);
                Ok(())
            }
            None => Err(Error::BadConfig(format!("unknown server id {}", id))),
        }
    }

    pub fn get(&self, id: ServerId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: ServerId) -> Option<&mut Server> {
        self.servers.iter_mut().find(|s| s.id == id)
    }

    /// Position of the server in the configuration order.
    pub fn index_of(&self, id: ServerId) -> Option<usize> {
        self.servers.iter().position(|s| s.id == id)
    }

    /// Position of the server among the voting servers only.
    ///
    /// Candidate vote tallies are indexed this way.
    pub fn index_of_voting(&self, id: ServerId) -> Option<usize> {
        self.servers.iter().filter(|s| s.voting).position(|s| s.id == id)
    }

    pub fn n_voting(&self) -> usize {
        self.servers.iter().filter(|s| s.voting).count()
    }

    pub fn voter_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.servers.iter().filter(|s| s.voting).map(|s| s.id)
    }

    /// Smallest number of voters that forms a strict majority.
    pub(crate) fn quorum(&self) -> usize {
        self.n_voting() / 2 + 1
    }

    /// Serialize deterministically.
    ///
    /// Layout: version byte, server count, then per server the id, the
    /// voting flag and the length-prefixed address. All integers are
    /// big-endian. Equal configurations always produce equal bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.servers.len() * 24);
        buf.put_u8(ENCODING_VERSION);
        buf.put_u64(self.servers.len() as u64);
        for server in &self.servers {
            buf.put_u64(server.id);
            buf.put_u8(server.voting as u8);
            buf.put_u16(server.address.len() as u16);
            buf.put_slice(server.address.as_bytes());
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut buf = data;
        if buf.remaining() < 9 {
            return Err(Error::BadConfig("configuration payload too short".to_string()));
        }
        let version = buf.get_u8();
        if version != ENCODING_VERSION {
            return Err(Error::BadConfig(format!("unknown configuration encoding version {}", version)));
        }
        let n = buf.get_u64();

        let mut configuration = Configuration::new();
        for _ in 0..n {
            if buf.remaining() < 11 {
                return Err(Error::BadConfig("truncated configuration payload".to_string()));
            }
            let id = buf.get_u64();
            let voting = buf.get_u8() != 0;
            let address_len = buf.get_u16() as usize;
            if buf.remaining() < address_len {
                return Err(Error::BadConfig("truncated configuration payload".to_string()));
            }
            let address = String::from_utf8(buf[..address_len].to_vec())
                .map_err(|e| Error::BadConfig(format!("address is not utf-8: {}", e)))?;
            buf.advance(address_len);
            configuration.add(id, address, voting)?;
        }
        Ok(configuration)
    }
}
