use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::config::SmtpConfig;

/// Outgoing notification mail. Sending is fire-and-forget: callers log a
/// failure and carry on.
pub trait Mailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

pub struct SmtpMailer {
    transport: SmtpTransport,
    sender: String,
}

impl SmtpMailer {
    pub fn new(cfg: &SmtpConfig) -> anyhow::Result<SmtpMailer> {
        let mut builder = SmtpTransport::starttls_relay(&cfg.server)?.port(cfg.port);
        if let (Some(user), Some(pass)) = (cfg.username.as_ref(), cfg.password.as_ref()) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        Ok(SmtpMailer {
            transport: builder.build(),
            sender: cfg.sender.clone(),
        })
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let message = Message::builder()
            .from(self.sender.parse()?)
            .to(to.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;
        self.transport.send(&message)?;
        Ok(())
    }
}

/// Used when no SMTP server is configured.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, _body: &str) -> anyhow::Result<()> {
        log::info!("mail (not sent, no SMTP configured) to={} subject={:?}", to, subject);
        Ok(())
    }
}

pub fn from_config(smtp: Option<&SmtpConfig>) -> Box<dyn Mailer> {
    match smtp {
        Some(cfg) => match SmtpMailer::new(cfg) {
            Ok(m) => {
                log::info!("mail via {}:{}", cfg.server, cfg.port);
                Box::new(m)
            }
            Err(e) => {
                log::error!("smtp setup failed, mail will only be logged: {:#}", e);
                Box::new(LogMailer)
            }
        },
        None => Box::new(LogMailer),
    }
}

pub fn send_logged(mailer: &dyn Mailer, to: &str, subject: &str, body: &str) {
    if let Err(e) = mailer.send(to, subject, body) {
        log::warn!("mail to {} failed: {:#}", to, e);
    }
}
