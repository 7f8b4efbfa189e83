//! Ready-made domain catalogs for the job-matching product.
//!
//! Hosts pick the catalog for the signed-in role and register it wholesale:
//! seekers get their profile, job feed, applications, saved items,
//! messaging, and interviews; employer portals get the company profile,
//! postings, hiring pipeline, messaging, and interviews. Every catalog
//! fetcher rides on one [`RemoteSource`] implementation supplied by the
//! host.

mod domains;
mod models;
mod source;

pub use domains::{employer_domains, seeker_domains};
pub use models::{
  Application, CompanyProfile, Conversation, Interview, JobPosting, PipelineCandidate, Profile,
  SavedItem, UnreadCounts,
};
pub use source::{soft_timeout, DomainFilter, RemoteSource};
