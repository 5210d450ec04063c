use polyserve::domain::{DomainError, DomainTemplate, HostTable, VirtualHost};
use polyserve::http::request::{Method, RequestBuilder};
use polyserve::http::response::{Response, StatusCode};
use polyserve::http::route::{RouteMatch, Router, TemplateError, compile_template, handler};

#[test]
fn test_domain_exact_is_case_insensitive() {
    let d = DomainTemplate::new("Example.com").unwrap();
    assert!(d.is_exact());
    assert!(d.matches("example.COM"));
    assert!(!d.matches("www.example.com"));
}

#[test]
fn test_domain_trailing_wildcard() {
    let d = DomainTemplate::new("api.*").unwrap();
    assert!(!d.is_exact());
    assert!(d.matches("api.example.org"));
    assert!(!d.matches("web.example.org"));
}

#[test]
fn test_domain_dot_is_literal() {
    let d = DomainTemplate::new("*.example.com").unwrap();
    assert!(!d.matches("www.exampleXcom"));
}

#[test]
fn test_domain_bracket_groups_pass_through() {
    let d = DomainTemplate::new("(www|api).example.com").unwrap();
    assert!(d.matches("www.example.com"));
    assert!(d.matches("api.example.com"));
    assert!(!d.matches("mail.example.com"));
}

#[test]
fn test_domain_template_errors() {
    assert!(matches!(
        DomainTemplate::new("a.*.b"),
        Err(DomainError::MisplacedAsterisk(_))
    ));
    assert!(matches!(
        DomainTemplate::new("(www.example.com"),
        Err(DomainError::UnbalancedBrackets(_))
    ));
    assert!(matches!(
        DomainTemplate::new("www).example.com"),
        Err(DomainError::UnbalancedBrackets(_))
    ));
}

#[test]
fn test_host_table_first_template_wins() {
    let mut table = HostTable::new();
    for (name, domain) in [("first", "*.example.com"), ("second", "*.com")] {
        let mut host = VirtualHost::new(name);
        host.add_domain(domain).unwrap();
        table.add(host);
    }

    assert_eq!(table.find("www.example.com"), Some(0));
    assert_eq!(table.find("other.com"), Some(1));
    assert_eq!(table.get(1).map(|h| h.name.as_str()), Some("second"));
}

#[test]
fn test_template_params_in_order() {
    let t = compile_template(r"/users/{id|\d+}/posts/{slug|[a-z-]+}").unwrap();
    let params = t.captures("/users/7/posts/hello-world").unwrap();

    assert_eq!(
        params,
        vec![
            ("id".to_string(), "7".to_string()),
            ("slug".to_string(), "hello-world".to_string()),
        ]
    );
    assert!(t.captures("/users/x/posts/hello").is_none());
    assert!(t.captures("/users/7/posts/hello/extra").is_none());
}

#[test]
fn test_template_multi_word_name() {
    assert!(matches!(
        compile_template(r"/{user id|\d+}"),
        Err(TemplateError::MultiWordName(_))
    ));
}

#[test]
fn test_router_static_before_template() {
    let mut router = Router::new();
    router.add(r"/items/{id|.+}", Method::GET, "template").unwrap();
    router.add("/items/new", Method::GET, "static").unwrap();

    match router.find("/items/new", Method::GET) {
        RouteMatch::Found { handler, params } => {
            assert_eq!(handler, "static");
            assert!(params.is_empty());
        }
        _ => panic!("expected a match"),
    }

    match router.find("/items/9", Method::GET) {
        RouteMatch::Found { handler, params } => {
            assert_eq!(handler, "template");
            assert_eq!(params, vec![("id".to_string(), "9".to_string())]);
        }
        _ => panic!("expected a match"),
    }
}

#[test]
fn test_router_method_not_allowed_and_not_found() {
    let mut router = Router::new();
    router.add("/submit", Method::POST, 1).unwrap();
    router.add("/submit", Method::PUT, 2).unwrap();
    assert_eq!(router.len(), 1);

    assert!(matches!(router.find("/submit", Method::GET), RouteMatch::MethodNotAllowed));
    assert!(matches!(router.find("/nothing", Method::GET), RouteMatch::NotFound));
    assert!(matches!(
        router.find("/submit", Method::PUT),
        RouteMatch::Found { handler: 2, .. }
    ));
}

#[test]
fn test_virtual_host_route_handler_runs() {
    let mut host = VirtualHost::new("app");
    host.add_route(
        r"/hello/{name|\w+}",
        Method::GET,
        handler(|req, res| {
            res.write(format!("hi {}", req.query("name").unwrap_or("?")));
        }),
    )
    .unwrap();

    let RouteMatch::Found { handler, params } = host.routes.find("/hello/ann", Method::GET) else {
        panic!("route not found");
    };

    let mut req = RequestBuilder::new()
        .method(Method::GET)
        .uri("/hello/ann")
        .build()
        .unwrap();
    req.query.extend(params);

    let mut res = Response::new(StatusCode::Ok);
    handler(&req, &mut res);
    assert_eq!(&res.body[..], b"hi ann");
}
