//! vCenter collaborator interface (Changed Block Tracking, change-id).
//! The Node never touches qemu-nbd or the repository
//! filesystem directly -- it only ever talks to vCenter and to the Hub's
//! exported NBD targets.
//!
//! vCenter's control plane is SOAP (`vim25`); there is no maintained Rust
//! binding for it, so `HttpVCenterClient` builds the handful of envelopes
//! this system needs by hand and pulls the one or two fields it cares
//! about out of the response with simple substring scans rather than
//! pulling in a general XML stack for that alone. Bulk disk reads go
//! through vCenter's HTTPS datastore file access, which is a plain GET.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct DiskExtent {
    pub offset: u64,
    pub length: u64,
}

#[derive(Error, Debug)]
pub enum VCenterError {
    #[error("vcenter login failed: {0}")]
    LoginFailed(String),
    #[error("vcenter request failed: {0}")]
    RequestFailed(String),
    #[error("vcenter returned a SOAP fault: {0}")]
    Fault(String),
    #[error("unexpected response shape from vcenter: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone)]
pub struct VCenterSession {
    pub host: String,
    pub cookie: String,
}

/// One VM's worth of connection context the executor threads through a
/// single backup job: the snapshot it took and the session it's using.
#[async_trait]
pub trait VCenterClient: Send + Sync {
    async fn login(&self, host: &str, user: &str, password: &str) -> Result<VCenterSession, VCenterError>;

    /// Takes exactly one snapshot covering every disk of `vm_path`. The
    /// single-snapshot-per-VM guarantee lives here: the executor calls
    /// this once per job, never once per disk.
    async fn create_snapshot(&self, session: &VCenterSession, vm_path: &str) -> Result<String, VCenterError>;

    async fn remove_snapshot(&self, session: &VCenterSession, snapshot_moref: &str) -> Result<(), VCenterError>;

    /// CBT delta since `base_change_id`, scoped to one disk of the snapshot.
    async fn query_changed_areas(
        &self,
        session: &VCenterSession,
        snapshot_moref: &str,
        disk_key: i64,
        base_change_id: &str,
        disk_size_bytes: u64,
    ) -> Result<Vec<DiskExtent>, VCenterError>;

    /// The change-id CBT assigns the disk at the point the snapshot was taken.
    async fn current_change_id(
        &self,
        session: &VCenterSession,
        snapshot_moref: &str,
        disk_key: i64,
    ) -> Result<String, VCenterError>;

    /// Reads `length` bytes at `offset` from the named disk's backing file
    /// as of the open snapshot, via the datastore HTTPS file endpoint.
    async fn read_disk_range(
        &self,
        session: &VCenterSession,
        datastore: &str,
        vmdk_path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, VCenterError>;
}

pub struct HttpVCenterClient {
    client: reqwest::Client,
}

impl Default for HttpVCenterClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpVCenterClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .expect("reqwest client builder"),
        }
    }

    async fn soap_call(
        &self,
        session: &VCenterSession,
        body: &str,
    ) -> Result<String, VCenterError> {
        let url = format!("https://{}/sdk", session.host);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", "urn:vim25/6.7")
            .header("Cookie", &session.cookie)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| VCenterError::RequestFailed(e.to_string()))?;

        let text = response
            .text()
            .await
            .map_err(|e| VCenterError::RequestFailed(e.to_string()))?;

        if text.contains("<soapenv:Fault>") || text.contains("<soap:Fault>") {
            return Err(VCenterError::Fault(extract_tag(&text, "faultstring").unwrap_or(text)));
        }
        Ok(text)
    }
}

#[async_trait]
impl VCenterClient for HttpVCenterClient {
    async fn login(&self, host: &str, user: &str, password: &str) -> Result<VCenterSession, VCenterError> {
        let envelope = format!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:vim25="urn:vim25">
<soapenv:Body>
<vim25:Login>
<vim25:_this type="SessionManager">SessionManager</vim25:_this>
<vim25:userName>{user}</vim25:userName>
<vim25:password>{password}</vim25:password>
</vim25:Login>
</soapenv:Body>
</soapenv:Envelope>"#
        );

        let url = format!("https://{host}/sdk");
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", "urn:vim25/6.7")
            .body(envelope)
            .send()
            .await
            .map_err(|e| VCenterError::LoginFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VCenterError::LoginFailed(format!(
                "vcenter returned {}",
                response.status()
            )));
        }

        let cookie = response
            .headers()
            .get("Set-Cookie")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| VCenterError::LoginFailed("no session cookie in response".to_string()))?;

        Ok(VCenterSession {
            host: host.to_string(),
            cookie,
        })
    }

    async fn create_snapshot(&self, session: &VCenterSession, vm_path: &str) -> Result<String, VCenterError> {
        let envelope = format!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:vim25="urn:vim25">
<soapenv:Body>
<vim25:CreateSnapshot_Task>
<vim25:_this type="VirtualMachine">{vm_path}</vim25:_this>
<vim25:name>vmbak</vim25:name>
<vim25:memory>false</vim25:memory>
<vim25:quiesce>true</vim25:quiesce>
</vim25:CreateSnapshot_Task>
</soapenv:Body>
</soapenv:Envelope>"#
        );
        let response = self.soap_call(session, &envelope).await?;
        extract_tag(&response, "returnval")
            .ok_or_else(|| VCenterError::MalformedResponse("no snapshot moref in CreateSnapshot_Task reply".to_string()))
    }

    async fn remove_snapshot(&self, session: &VCenterSession, snapshot_moref: &str) -> Result<(), VCenterError> {
        let envelope = format!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:vim25="urn:vim25">
<soapenv:Body>
<vim25:RemoveSnapshot_Task>
<vim25:_this type="VirtualMachineSnapshot">{snapshot_moref}</vim25:_this>
<vim25:removeChildren>false</vim25:removeChildren>
</vim25:RemoveSnapshot_Task>
</soapenv:Body>
</soapenv:Envelope>"#
        );
        self.soap_call(session, &envelope).await?;
        Ok(())
    }

    async fn query_changed_areas(
        &self,
        session: &VCenterSession,
        snapshot_moref: &str,
        disk_key: i64,
        base_change_id: &str,
        disk_size_bytes: u64,
    ) -> Result<Vec<DiskExtent>, VCenterError> {
        let envelope = format!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:vim25="urn:vim25">
<soapenv:Body>
<vim25:QueryChangedDiskAreas>
<vim25:_this type="VirtualMachine">{snapshot_moref}</vim25:_this>
<vim25:snapshot type="VirtualMachineSnapshot">{snapshot_moref}</vim25:snapshot>
<vim25:deviceKey>{disk_key}</vim25:deviceKey>
<vim25:startOffset>0</vim25:startOffset>
<vim25:changeId>{base_change_id}</vim25:changeId>
</vim25:QueryChangedDiskAreas>
</soapenv:Body>
</soapenv:Envelope>"#
        );
        let response = self.soap_call(session, &envelope).await?;

        let mut extents = Vec::new();
        for chunk in response.split("<changedArea>").skip(1) {
            let offset = extract_tag(chunk, "start")
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| VCenterError::MalformedResponse("changedArea missing start".to_string()))?;
            let length = extract_tag(chunk, "length")
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| VCenterError::MalformedResponse("changedArea missing length".to_string()))?;
            extents.push(DiskExtent { offset, length });
        }
        if extents.is_empty() {
            // No changed areas reported: the disk is untouched since the
            // base change-id, which is a valid (if unusual) incremental.
            let _ = disk_size_bytes;
        }
        Ok(extents)
    }

    async fn current_change_id(
        &self,
        session: &VCenterSession,
        snapshot_moref: &str,
        disk_key: i64,
    ) -> Result<String, VCenterError> {
        let envelope = format!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:vim25="urn:vim25">
<soapenv:Body>
<vim25:RetrieveProperties>
<vim25:_this type="PropertyCollector">propertyCollector</vim25:_this>
<vim25:specSet>
<vim25:propSet>
<vim25:type>VirtualMachine</vim25:type>
<vim25:pathSet>snapshot.currentSnapshot.config.hardware.device[{disk_key}].backing.changeId</vim25:pathSet>
</vim25:propSet>
<vim25:objectSet>
<vim25:obj type="VirtualMachineSnapshot">{snapshot_moref}</vim25:obj>
</vim25:objectSet>
</vim25:specSet>
</vim25:RetrieveProperties>
</soapenv:Body>
</soapenv:Envelope>"#
        );
        let response = self.soap_call(session, &envelope).await?;
        extract_tag(&response, "val")
            .ok_or_else(|| VCenterError::MalformedResponse("no changeId in RetrieveProperties reply".to_string()))
    }

    async fn read_disk_range(
        &self,
        session: &VCenterSession,
        datastore: &str,
        vmdk_path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, VCenterError> {
        let url = format!(
            "https://{}/folder/{}?dsName={}",
            session.host, vmdk_path, datastore
        );
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let response = self
            .client
            .get(&url)
            .header("Cookie", &session.cookie)
            .header("Range", range)
            .send()
            .await
            .map_err(|e| VCenterError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VCenterError::RequestFailed(format!(
                "datastore read returned {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| VCenterError::RequestFailed(e.to_string()))
    }
}

/// Pulls the text content of the first `<tag>...</tag>` (or `<ns:tag
/// ...>...</ns:tag>`) found in `xml`, ignoring any namespace prefix on
/// either the open or close tag. Good enough for the single-value
/// replies this client reads; anything more structured goes through
/// `query_changed_areas`'s own chunk-splitting instead.
fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open_needle = format!(":{tag}");
    let bare_needle = format!("<{tag}");
    let start_tag = xml
        .find(&bare_needle)
        .filter(|&i| xml[i + 1..].starts_with(tag))
        .or_else(|| xml.find(&open_needle).map(|i| i - 1))?;
    let after_open = xml[start_tag..].find('>')? + start_tag + 1;
    let close_tag = xml[after_open..].find("</")? + after_open;
    Some(xml[after_open..close_tag].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_tag_reads_simple_value() {
        let xml = "<returnval>snapshot-104</returnval>";
        assert_eq!(extract_tag(xml, "returnval"), Some("snapshot-104".to_string()));
    }

    #[test]
    fn extract_tag_handles_namespaced_open_tag() {
        let xml = r#"<vim25:returnval type="VirtualMachineSnapshot">snapshot-104</vim25:returnval>"#;
        assert_eq!(extract_tag(xml, "returnval"), Some("snapshot-104".to_string()));
    }

    #[test]
    fn extract_tag_missing_returns_none() {
        assert_eq!(extract_tag("<foo>bar</foo>", "returnval"), None);
    }
}
