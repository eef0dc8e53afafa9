/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Control channel to the PTP daemon: one text line per datagram,
//! `<smi_name> T [ip…]`. A bare `T` clears the peer list.

use std::io;
use tokio::net::UdpSocket;
use tracing::debug;

pub struct PtpControl {
    smi_name: String,
    port: u16,
}

impl PtpControl {
    pub fn new(smi_name: String, port: u16) -> Self {
        Self { smi_name, port }
    }

    pub async fn clear_peers(&self) -> io::Result<()> {
        self.send(format!("{} T", self.smi_name)).await
    }

    pub async fn set_peers(&self, peers: &[String]) -> io::Result<()> {
        let mut message = format!("{} T", self.smi_name);
        for peer in peers {
            message.push(' ');
            message.push_str(peer);
        }
        self.send(message).await
    }

    async fn send(&self, message: String) -> io::Result<()> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        socket
            .send_to(message.as_bytes(), ("127.0.0.1", self.port))
            .await?;
        debug!("Sent PTP control message: \"{message}\"");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn peer_list_reaches_the_daemon_socket() {
        let daemon = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = daemon.local_addr().unwrap().port();

        let control = PtpControl::new("/airplay2-rx-aabbcc".to_owned(), port);
        control
            .set_peers(&["10.0.0.2".to_owned(), "10.0.0.3".to_owned()])
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = daemon.recv_from(&mut buf).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..len]).unwrap(),
            "/airplay2-rx-aabbcc T 10.0.0.2 10.0.0.3"
        );
    }

    #[tokio::test]
    async fn bare_t_clears_the_list() {
        let daemon = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = daemon.local_addr().unwrap().port();

        let control = PtpControl::new("/airplay2-rx-aabbcc".to_owned(), port);
        control.clear_peers().await.unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = daemon.recv_from(&mut buf).await.unwrap();
        assert_eq!(std::str::from_utf8(&buf[..len]).unwrap(), "/airplay2-rx-aabbcc T");
    }
}
